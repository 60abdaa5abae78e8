//! Tracing initialisation and pipeline lifecycle events.
//!
//! Call [`init_tracing`] once at program start. The `emit_*` functions log
//! the lifecycle of a run with stable `event` field values so log pipelines
//! can filter on them.

use tracing::{info, warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::pipeline::PipelineState;
use crate::stage::Stage;

/// Initialise the global tracing subscriber.
///
/// * `json`: when `true`, emit newline-delimited JSON log lines.
///   Logs always go to stderr; stdout carries the run summary.
/// * `level`: default verbosity when `RUST_LOG` is not set.
///
/// Only the first call takes effect.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

pub fn emit_pipeline_started(run_id: &str, package: &str, max_parallel: usize) {
    info!(event = "pipeline.started", run_id = %run_id, package = %package, max_parallel);
}

pub fn emit_state_entered(run_id: &str, state: PipelineState) {
    info!(event = "pipeline.state", run_id = %run_id, state = %state);
}

pub fn emit_stage_started(run_id: &str, stage: Stage) {
    info!(event = "stage.started", run_id = %run_id, stage = %stage);
}

pub fn emit_stage_finished(run_id: &str, stage: Stage, files: usize, failed: usize) {
    info!(
        event = "stage.finished",
        run_id = %run_id,
        stage = %stage,
        files,
        failed,
    );
}

pub fn emit_stage_aborted(run_id: &str, stage: Stage, reason: &str) {
    warn!(event = "stage.aborted", run_id = %run_id, stage = %stage, reason = %reason);
}

/// Emit event: run reached a terminal state.
pub fn emit_pipeline_finished(
    run_id: &str,
    state: PipelineState,
    duration_ms: u64,
    failed_files: usize,
) {
    info!(
        event = "pipeline.finished",
        run_id = %run_id,
        state = %state,
        duration_ms,
        failed_files,
    );
}
