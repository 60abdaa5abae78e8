//! Recursive file discovery by base-name glob.

use std::path::{Path, PathBuf};

use glob::Pattern;
use serde::Serialize;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::{HarvestError, HarvestResult};

/// A discovered file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FileMatch {
    pub path: PathBuf,
}

impl FileMatch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Base name of the file, lossily converted.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Start a fresh traversal of `root`.
///
/// A file matches when its base name matches `name_glob` and, if given, its
/// full path does not contain `exclude_substring`. Symlinks are not followed.
/// Siblings are visited in file-name order, so repeated walks of an unchanged
/// tree agree.
pub fn find(
    root: impl AsRef<Path>,
    name_glob: &str,
    exclude_substring: Option<&str>,
) -> HarvestResult<Discovery> {
    let root = root.as_ref();
    if !root.exists() {
        return Err(HarvestError::RootNotFound {
            path: root.to_path_buf(),
        });
    }

    let pattern = Pattern::new(name_glob).map_err(|e| HarvestError::InvalidPattern {
        pattern: name_glob.to_string(),
        reason: e.to_string(),
    })?;

    Ok(Discovery {
        walker: WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter(),
        pattern,
        exclude: exclude_substring.filter(|s| !s.is_empty()).map(str::to_string),
        warnings: Vec::new(),
    })
}

/// Lazy sequence of [`FileMatch`] produced by [`find`].
pub struct Discovery {
    walker: walkdir::IntoIter,
    pattern: Pattern,
    exclude: Option<String>,
    warnings: Vec<String>,
}

impl Discovery {
    /// Entries skipped because they could not be read.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn matches(&self, path: &Path) -> bool {
        let name_matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| self.pattern.matches(n))
            .unwrap_or(false);
        if !name_matches {
            return false;
        }
        match &self.exclude {
            Some(excluded) => !path.to_string_lossy().contains(excluded.as_str()),
            None => true,
        }
    }
}

impl Iterator for Discovery {
    type Item = FileMatch;

    fn next(&mut self) -> Option<FileMatch> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let location = e
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "<unknown>".to_string());
                    warn!(path = %location, error = %e, "Skipping unreadable entry");
                    self.warnings.push(format!("{}: {}", location, e));
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }
            if self.matches(entry.path()) {
                return Some(FileMatch::new(entry.into_path()));
            }
        }
    }
}
