//! Stage outcomes and the accumulated pipeline report.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{HarvestError, HarvestResult};
use crate::stage::Stage;

/// Outcome of a stage, or of one file inside a post-processing stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    Failure(String),
}

impl StageOutcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        StageOutcome::Failure(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success)
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageOutcome::Success => write!(f, "success"),
            StageOutcome::Failure(reason) => write!(f, "failure: {}", reason),
        }
    }
}

/// One line of the report. Stage-level entries have no file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub stage: Stage,
    pub file: Option<PathBuf>,
    pub outcome: StageOutcome,
}

impl fmt::Display for ReportEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{} {}: {}", self.stage, file.display(), self.outcome),
            None => write!(f, "{}: {}", self.stage, self.outcome),
        }
    }
}

/// A non-fatal problem noticed during a stage, such as an unreadable directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportWarning {
    pub stage: Stage,
    pub message: String,
}

impl fmt::Display for ReportWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} warning: {}", self.stage, self.message)
    }
}

/// Ordered record of every stage and per-file outcome of a run.
///
/// Each `(stage, file)` key appears at most once.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    entries: Vec<ReportEntry>,
    warnings: Vec<ReportWarning>,
    #[serde(skip)]
    keys: HashSet<(Stage, Option<PathBuf>)>,
}

impl PipelineReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a stage-level outcome.
    pub fn record_stage(&mut self, stage: Stage, outcome: StageOutcome) -> HarvestResult<()> {
        self.push(ReportEntry {
            stage,
            file: None,
            outcome,
        })
    }

    /// Record the outcome of one file inside `stage`.
    pub fn record_file(
        &mut self,
        stage: Stage,
        file: &Path,
        outcome: StageOutcome,
    ) -> HarvestResult<()> {
        self.push(ReportEntry {
            stage,
            file: Some(file.to_path_buf()),
            outcome,
        })
    }

    fn push(&mut self, entry: ReportEntry) -> HarvestResult<()> {
        let key = (entry.stage, entry.file.clone());
        if !self.keys.insert(key) {
            return Err(HarvestError::DuplicateReportEntry(match &entry.file {
                Some(file) => format!("{} {}", entry.stage, file.display()),
                None => entry.stage.to_string(),
            }));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn record_warning(&mut self, stage: Stage, message: impl Into<String>) {
        self.warnings.push(ReportWarning {
            stage,
            message: message.into(),
        });
    }

    pub fn warnings(&self) -> &[ReportWarning] {
        &self.warnings
    }

    /// Stage-level outcome, if the stage was reached.
    pub fn stage_outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.entries
            .iter()
            .find(|e| e.stage == stage && e.file.is_none())
            .map(|e| &e.outcome)
    }

    /// Per-file entries of `stage`, in recording order.
    pub fn file_entries(&self, stage: Stage) -> impl Iterator<Item = &ReportEntry> {
        self.entries
            .iter()
            .filter(move |e| e.stage == stage && e.file.is_some())
    }

    /// Number of per-file failures across all stages.
    pub fn file_failure_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.file.is_some() && e.outcome.is_failure())
            .count()
    }

    /// Human-readable dump, one line per entry followed by one per warning.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.to_string());
            out.push('\n');
        }
        for warning in &self.warnings {
            out.push_str(&warning.to_string());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_stage_is_rejected() {
        let mut report = PipelineReport::new();
        report.record_stage(Stage::Fetch, StageOutcome::Success).unwrap();
        let err = report
            .record_stage(Stage::Fetch, StageOutcome::failure("again"))
            .unwrap_err();
        assert!(matches!(err, HarvestError::DuplicateReportEntry(_)));
        assert_eq!(report.entries().len(), 1);
    }

    #[test]
    fn test_same_file_in_different_stages_is_allowed() {
        let mut report = PipelineReport::new();
        let file = Path::new("/tmp/a.dylib");
        report
            .record_file(Stage::DebugSymbols, file, StageOutcome::Success)
            .unwrap();
        report
            .record_file(Stage::ExtractTypes, file, StageOutcome::failure("exit code 1"))
            .unwrap();
        assert!(report
            .record_file(Stage::ExtractTypes, file, StageOutcome::Success)
            .is_err());
        assert_eq!(report.file_failure_count(), 1);
    }

    #[test]
    fn test_render_text_one_line_per_entry() {
        let mut report = PipelineReport::new();
        report.record_stage(Stage::Fetch, StageOutcome::Success).unwrap();
        report
            .record_file(
                Stage::ExtractTypes,
                Path::new("/tmp/a.dylib"),
                StageOutcome::failure("exit code 2"),
            )
            .unwrap();

        let text = report.render_text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "fetch: success",
                "extract_types /tmp/a.dylib: failure: exit code 2"
            ]
        );
    }

    #[test]
    fn test_warnings_render_after_entries() {
        let mut report = PipelineReport::new();
        report.record_warning(Stage::DebugSymbols, "/build/locked: Permission denied");
        report.record_stage(Stage::DebugSymbols, StageOutcome::Success).unwrap();

        assert_eq!(report.warnings().len(), 1);
        assert_eq!(
            report.render_text(),
            "extract_debug_symbols: success\n\
             extract_debug_symbols warning: /build/locked: Permission denied\n"
        );
        assert_eq!(report.file_failure_count(), 0);
    }

    #[test]
    fn test_stage_outcome_lookup() {
        let mut report = PipelineReport::new();
        report.record_stage(Stage::Build, StageOutcome::failure("exit code 2")).unwrap();
        assert!(report.stage_outcome(Stage::Build).unwrap().is_failure());
        assert!(report.stage_outcome(Stage::Collect).is_none());
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let json = serde_json::to_value(StageOutcome::failure("boom")).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["reason"], "boom");
    }
}
