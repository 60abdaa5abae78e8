//! Error types for the harvest pipeline.

use std::path::PathBuf;

/// Errors produced by the pipeline components.
///
/// `ExecutableNotFound`, `InvalidWorkingDirectory`, `RootNotFound` and
/// `FatalStageFailure` abort a run. `PerFileFailure` is only ever recorded in
/// the report. `OutputLocationUnwritable` is fatal at the collecting stage.
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("executable not found: {program}")]
    ExecutableNotFound { program: String },

    #[error("invalid working directory: {}", path.display())]
    InvalidWorkingDirectory { path: PathBuf },

    #[error("discovery root not found: {}", path.display())]
    RootNotFound { path: PathBuf },

    #[error("stage '{stage}' failed: {reason}")]
    FatalStageFailure { stage: String, reason: String },

    #[error("{}: {reason}", file.display())]
    PerFileFailure { file: PathBuf, reason: String },

    #[error("output location {} is not writable: {source}", path.display())]
    OutputLocationUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid glob pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid command template: {0}")]
    InvalidTemplate(String),

    #[error("max_parallel must be at least 1, got {0}")]
    InvalidParallelism(usize),

    #[error("report already has an entry for {0}")]
    DuplicateReportEntry(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HarvestError {
    /// Whether this error stops the pipeline when raised by a stage.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, HarvestError::PerFileFailure { .. })
    }
}

/// Result type for harvest operations.
pub type HarvestResult<T> = std::result::Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_file_failure_is_not_fatal() {
        let err = HarvestError::PerFileFailure {
            file: PathBuf::from("/tmp/a.dylib"),
            reason: "exit code 1".to_string(),
        };
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "/tmp/a.dylib: exit code 1");
    }

    #[test]
    fn test_stage_failure_is_fatal() {
        let err = HarvestError::FatalStageFailure {
            stage: "fetch".to_string(),
            reason: "exit code 1".to_string(),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("fetch"));
    }
}
