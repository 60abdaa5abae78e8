//! symharvest - harvest type libraries from a source package
//!
//! Provides a pipeline orchestrator that:
//! - Fetches and builds a package with external tools
//! - Extracts debug symbols and type libraries per built artifact, in parallel
//! - Collects the generated type libraries and writes a run report

pub mod collect;
pub mod command;
pub mod config;
pub mod discover;
pub mod error;
pub mod pipeline;
pub mod postprocess;
pub mod report;
pub mod stage;
pub mod telemetry;

// Re-export key types
pub use collect::{collect, CollectedArtifact, Collection};
pub use command::{Command, CommandResult, CommandRunner, ProcessRunner, TIMED_OUT_EXIT_CODE};
pub use config::HarvestConfig;
pub use discover::{find, Discovery, FileMatch};
pub use error::{HarvestError, HarvestResult};
pub use pipeline::{Pipeline, PipelineRequest, PipelineRun, PipelineState};
pub use postprocess::PostProcessor;
pub use report::{PipelineReport, ReportWarning, StageOutcome};
pub use stage::{CommandTemplate, Stage};
pub use telemetry::init_tracing;
