//! Copy generated outputs into a single output directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::discover;
use crate::error::{HarvestError, HarvestResult};

/// One file placed into the output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectedArtifact {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Hex SHA-256 of the copied content.
    pub digest: String,
    /// The destination already held identical content.
    pub unchanged: bool,
}

/// Everything placed into the output directory by one [`collect`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Collection {
    pub artifacts: Vec<CollectedArtifact>,
    /// Sources that were skipped because they could not be read.
    pub warnings: Vec<String>,
}

/// Copy every file under `source_root` matching `name_glob` into `output_dir`.
///
/// Destinations mirror the path relative to `source_root`. Originals are not
/// modified and files already inside `output_dir` are skipped. Only a failure
/// to create or write the output location is an error; unreadable sources are
/// skipped and reported as warnings.
pub fn collect(
    source_root: &Path,
    name_glob: &str,
    exclude_substring: Option<&str>,
    output_dir: &Path,
) -> HarvestResult<Collection> {
    let unwritable = |source| HarvestError::OutputLocationUnwritable {
        path: output_dir.to_path_buf(),
        source,
    };
    fs::create_dir_all(output_dir).map_err(unwritable)?;
    let output_dir_abs = fs::canonicalize(output_dir).map_err(unwritable)?;

    let mut collection = Collection::default();
    let mut found = discover::find(source_root, name_glob, exclude_substring)?;
    for file in found.by_ref() {
        let source = file.path;
        if fs::canonicalize(&source)
            .map(|p| p.starts_with(&output_dir_abs))
            .unwrap_or(false)
        {
            continue;
        }

        let content = match fs::read(&source) {
            Ok(content) => content,
            Err(e) => {
                warn!(source = %source.display(), error = %e, "Skipping unreadable output");
                collection
                    .warnings
                    .push(format!("{}: {}", source.display(), e));
                continue;
            }
        };

        let relative = match source.strip_prefix(source_root) {
            Ok(rel) if rel.file_name().is_some() => rel.to_path_buf(),
            _ => PathBuf::from(source.file_name().unwrap_or_default()),
        };
        let destination = output_dir.join(relative);

        collection
            .artifacts
            .push(copy_artifact(&source, &content, &destination)?);
    }
    collection.warnings.extend_from_slice(found.warnings());

    Ok(collection)
}

fn copy_artifact(
    source: &Path,
    content: &[u8],
    destination: &Path,
) -> HarvestResult<CollectedArtifact> {
    let digest = sha256_hex(content);

    let unchanged = fs::read(destination)
        .map(|existing| sha256_hex(&existing) == digest)
        .unwrap_or(false);

    if !unchanged {
        let unwritable = |source| HarvestError::OutputLocationUnwritable {
            path: destination.to_path_buf(),
            source,
        };
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(unwritable)?;
        }
        fs::write(destination, content).map_err(unwritable)?;
    }

    debug!(
        source = %source.display(),
        destination = %destination.display(),
        unchanged,
        "Collected artifact"
    );

    Ok(CollectedArtifact {
        source: source.to_path_buf(),
        destination: destination.to_path_buf(),
        digest,
        unchanged,
    })
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
