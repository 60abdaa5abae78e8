//! Pipeline orchestration: fetch, build, extract, collect.
//!
//! Stages run strictly one after another. Fetch and build failures abort the
//! run; per-file failures in the two extraction stages are recorded and the
//! run carries on to collecting.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::collect::{self, CollectedArtifact};
use crate::command::CommandRunner;
use crate::config::HarvestConfig;
use crate::discover::{self, FileMatch};
use crate::error::{HarvestError, HarvestResult};
use crate::postprocess::PostProcessor;
use crate::report::{PipelineReport, StageOutcome};
use crate::stage::{CommandTemplate, Stage, TemplateContext};
use crate::telemetry;

/// File name of the text report written to the output directory.
pub const REPORT_TEXT_FILE: &str = "report.txt";

/// File name of the JSON report written to the output directory.
pub const REPORT_JSON_FILE: &str = "report.json";

/// Orchestrator states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    NotStarted,
    Fetching,
    Building,
    ExtractingDebugSymbols,
    ExtractingTypes,
    Collecting,
    Completed,
    Aborted,
}

impl PipelineState {
    /// The stage executed while in this state.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineState::Fetching => Some(Stage::Fetch),
            PipelineState::Building => Some(Stage::Build),
            PipelineState::ExtractingDebugSymbols => Some(Stage::DebugSymbols),
            PipelineState::ExtractingTypes => Some(Stage::ExtractTypes),
            PipelineState::Collecting => Some(Stage::Collect),
            _ => None,
        }
    }

    /// Successor on the success path. Terminal states have none.
    fn next(&self) -> Option<PipelineState> {
        match self {
            PipelineState::NotStarted => Some(PipelineState::Fetching),
            PipelineState::Fetching => Some(PipelineState::Building),
            PipelineState::Building => Some(PipelineState::ExtractingDebugSymbols),
            PipelineState::ExtractingDebugSymbols => Some(PipelineState::ExtractingTypes),
            PipelineState::ExtractingTypes => Some(PipelineState::Collecting),
            PipelineState::Collecting => Some(PipelineState::Completed),
            PipelineState::Completed | PipelineState::Aborted => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Aborted)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::NotStarted => "not_started",
            PipelineState::Fetching => "fetching",
            PipelineState::Building => "building",
            PipelineState::ExtractingDebugSymbols => "extracting_debug_symbols",
            PipelineState::ExtractingTypes => "extracting_types",
            PipelineState::Collecting => "collecting",
            PipelineState::Completed => "completed",
            PipelineState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// What to harvest and where.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRequest {
    pub package: String,
    pub build_dir: PathBuf,
    pub output_dir: PathBuf,
    pub max_parallel: usize,
}

impl PipelineRequest {
    pub fn new(
        package: impl Into<String>,
        build_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            package: package.into(),
            build_dir: build_dir.into(),
            output_dir: output_dir.into(),
            max_parallel: 1,
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }
}

/// Why a run was aborted.
#[derive(Debug, Clone, Serialize)]
pub struct FatalFailure {
    pub stage: Stage,
    pub reason: String,
    /// Captured stderr of the failing command, if a command ran.
    pub stderr: String,
}

/// Result of a pipeline run, immutable once returned.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub package: String,
    pub state: PipelineState,
    pub report: PipelineReport,
    pub failure: Option<FatalFailure>,
    pub collected: Vec<CollectedArtifact>,
    pub report_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl PipelineRun {
    pub fn is_completed(&self) -> bool {
        self.state == PipelineState::Completed
    }

    /// Number of per-file failures across both extraction stages.
    pub fn failed_file_count(&self) -> usize {
        self.report.file_failure_count()
    }

    /// The abort reason as an error value.
    pub fn fatal_error(&self) -> Option<HarvestError> {
        self.failure
            .as_ref()
            .map(|f| HarvestError::FatalStageFailure {
                stage: f.stage.name().to_string(),
                reason: f.reason.clone(),
            })
    }

    /// Write `report.txt` and `report.json` into `output_dir`.
    pub fn write_report(&self, output_dir: &Path) -> HarvestResult<PathBuf> {
        let unwritable = |source| HarvestError::OutputLocationUnwritable {
            path: output_dir.to_path_buf(),
            source,
        };
        fs::create_dir_all(output_dir).map_err(unwritable)?;

        let text_path = output_dir.join(REPORT_TEXT_FILE);
        fs::write(&text_path, self.report.render_text()).map_err(unwritable)?;

        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::from)?;
        fs::write(output_dir.join(REPORT_JSON_FILE), json).map_err(unwritable)?;

        Ok(text_path)
    }
}

/// Path of the DWARF file `dsymutil` produces for `artifact`:
/// `<artifact>.dSYM/Contents/Resources/DWARF/<artifact name>`.
pub fn dwarf_file_for(artifact: &Path) -> PathBuf {
    let mut bundle = OsString::from(artifact.as_os_str());
    bundle.push(".dSYM");
    let name = artifact.file_name().unwrap_or_default();
    PathBuf::from(bundle)
        .join("Contents")
        .join("Resources")
        .join("DWARF")
        .join(name)
}

/// Path of the type library written for `artifact`.
pub fn type_library_for(artifact: &Path, extension: &str) -> PathBuf {
    artifact.with_extension(extension.trim_start_matches('.'))
}

/// Mutable state of one run, owned by [`Pipeline::run`].
struct Execution {
    run_id: String,
    state: PipelineState,
    report: PipelineReport,
    stderr: String,
}

impl Execution {
    fn advance(&mut self) {
        if let Some(next) = self.state.next() {
            self.state = next;
            telemetry::emit_state_entered(&self.run_id, next);
            if let Some(stage) = next.stage() {
                telemetry::emit_stage_started(&self.run_id, stage);
            }
        }
    }
}

/// The pipeline orchestrator.
pub struct Pipeline {
    config: HarvestConfig,
    runner: Arc<dyn CommandRunner>,
}

impl Pipeline {
    pub fn new(config: HarvestConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// Run every stage for `request` and return the terminal run record.
    ///
    /// Stage failures never surface as `Err`; they produce an `Aborted` run.
    /// `Err` is returned only for an invalid request.
    pub async fn run(&self, request: &PipelineRequest) -> HarvestResult<PipelineRun> {
        if request.max_parallel == 0 {
            return Err(HarvestError::InvalidParallelism(request.max_parallel));
        }

        let run_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("symharvest.run", run_id = %run_id);
        self.run_inner(request, run_id).instrument(span).await
    }

    async fn run_inner(
        &self,
        request: &PipelineRequest,
        run_id: String,
    ) -> HarvestResult<PipelineRun> {
        let started_at = Utc::now();
        let start = Instant::now();
        telemetry::emit_pipeline_started(&run_id, &request.package, request.max_parallel);

        let mut exec = Execution {
            run_id: run_id.clone(),
            state: PipelineState::NotStarted,
            report: PipelineReport::new(),
            stderr: String::new(),
        };

        let (state, failure, collected) = match self.drive(request, &mut exec).await {
            Ok(collected) => {
                exec.advance();
                (exec.state, None, collected)
            }
            Err(error) => {
                let stage = exec.state.stage().unwrap_or(Stage::Fetch);
                let reason = match error {
                    HarvestError::FatalStageFailure { reason, .. } => reason,
                    other => other.to_string(),
                };
                telemetry::emit_stage_aborted(&run_id, stage, &reason);
                if exec
                    .report
                    .record_stage(stage, StageOutcome::failure(reason.clone()))
                    .is_err()
                {
                    warn!(stage = %stage, "Stage outcome already recorded");
                }
                exec.state = PipelineState::Aborted;
                let failure = FatalFailure {
                    stage,
                    reason,
                    stderr: std::mem::take(&mut exec.stderr),
                };
                (PipelineState::Aborted, Some(failure), Vec::new())
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let mut run = PipelineRun {
            run_id: run_id.clone(),
            package: request.package.clone(),
            state,
            report: exec.report,
            failure,
            collected,
            report_path: None,
            started_at,
            finished_at: Utc::now(),
            duration_ms,
        };

        match run.write_report(&request.output_dir) {
            Ok(path) => run.report_path = Some(path),
            Err(e) => warn!(error = %e, "Failed to write pipeline report"),
        }

        telemetry::emit_pipeline_finished(&run_id, run.state, duration_ms, run.failed_file_count());
        Ok(run)
    }

    async fn drive(
        &self,
        request: &PipelineRequest,
        exec: &mut Execution,
    ) -> HarvestResult<Vec<CollectedArtifact>> {
        let tools = &self.config.tools;
        let ctx = TemplateContext::for_package(&request.package, &request.build_dir);

        exec.advance();
        if !request.build_dir.is_dir() {
            return Err(HarvestError::InvalidWorkingDirectory {
                path: request.build_dir.clone(),
            });
        }
        self.run_stage_command(Stage::Fetch, &tools.fetch, &ctx, request, exec)
            .await?;

        exec.advance();
        self.run_stage_command(Stage::Build, &tools.build, &ctx, request, exec)
            .await?;

        exec.advance();
        self.extract_debug_symbols(&ctx, request, exec).await?;

        exec.advance();
        self.extract_types(&ctx, request, exec).await?;

        exec.advance();
        let discovery = &self.config.discovery;
        let collection = collect::collect(
            &request.build_dir,
            &discovery.output_glob,
            discovery.exclude(),
            &request.output_dir,
        )?;
        for warning in &collection.warnings {
            exec.report.record_warning(Stage::Collect, warning.as_str());
        }
        exec.report.record_stage(Stage::Collect, StageOutcome::Success)?;
        info!(
            collected = collection.artifacts.len(),
            skipped = collection.warnings.len(),
            output_dir = %request.output_dir.display(),
            "Collected type libraries"
        );
        telemetry::emit_stage_finished(
            &exec.run_id,
            Stage::Collect,
            collection.artifacts.len(),
            0,
        );

        Ok(collection.artifacts)
    }

    async fn run_stage_command(
        &self,
        stage: Stage,
        template: &CommandTemplate,
        ctx: &TemplateContext,
        request: &PipelineRequest,
        exec: &mut Execution,
    ) -> HarvestResult<()> {
        let command = template.render(ctx, &request.build_dir)?;
        info!(stage = %stage, command = %command, "Executing stage");

        let result = self
            .runner
            .run(&command, self.config.timeouts.stage())
            .await?;

        if !result.success() {
            exec.stderr = result.stderr_lossy();
            return Err(HarvestError::FatalStageFailure {
                stage: stage.name().to_string(),
                reason: result.failure_reason(),
            });
        }

        exec.report.record_stage(stage, StageOutcome::Success)?;
        telemetry::emit_stage_finished(&exec.run_id, stage, 0, 0);
        Ok(())
    }

    /// Artifacts under the build directory. Entries the walk could not read
    /// are recorded as warnings of `stage`.
    fn discover_artifacts(
        &self,
        stage: Stage,
        request: &PipelineRequest,
        exec: &mut Execution,
    ) -> HarvestResult<Vec<FileMatch>> {
        let discovery = &self.config.discovery;
        let mut found = discover::find(
            &request.build_dir,
            &discovery.artifact_glob,
            discovery.exclude(),
        )?;
        let artifacts: Vec<FileMatch> = found.by_ref().collect();
        if !found.warnings().is_empty() {
            warn!(
                stage = %stage,
                skipped = found.warnings().len(),
                "Discovery skipped unreadable entries"
            );
        }
        for warning in found.warnings() {
            exec.report.record_warning(stage, warning.as_str());
        }
        Ok(artifacts)
    }

    fn processor(&self) -> PostProcessor {
        PostProcessor::new(Arc::clone(&self.runner)).with_timeout(self.config.timeouts.file())
    }

    async fn extract_debug_symbols(
        &self,
        ctx: &TemplateContext,
        request: &PipelineRequest,
        exec: &mut Execution,
    ) -> HarvestResult<()> {
        let artifacts = self.discover_artifacts(Stage::DebugSymbols, request, exec)?;
        let template = &self.config.tools.debug_symbols;

        let results = self
            .processor()
            .apply(
                artifacts,
                |file| template.render(&ctx.clone().with_file(&file.path), &request.build_dir),
                request.max_parallel,
            )
            .await?;

        self.record_files(Stage::DebugSymbols, results, exec)
    }

    async fn extract_types(
        &self,
        ctx: &TemplateContext,
        request: &PipelineRequest,
        exec: &mut Execution,
    ) -> HarvestResult<()> {
        let discovery = &self.config.discovery;
        let template = &self.config.tools.extract_types;

        let artifacts = self.discover_artifacts(Stage::ExtractTypes, request, exec)?;

        // Outcomes are slotted by discovery index so the report keeps
        // discovery order whether or not a file was pre-failed.
        let mut outcomes: Vec<Option<StageOutcome>> = vec![None; artifacts.len()];
        let mut ready = Vec::new();
        for (index, artifact) in artifacts.iter().enumerate() {
            let dwarf = dwarf_file_for(&artifact.path);
            if discovery.require_debug_symbols && !dwarf.is_file() {
                let reason = format!("no DWARF file at {}", dwarf.display());
                outcomes[index] = Some(StageOutcome::Failure(reason));
            } else {
                ready.push(index);
            }
        }

        let processed = self
            .processor()
            .apply(
                ready.iter().map(|&index| artifacts[index].clone()).collect(),
                |file| {
                    let file_ctx = ctx
                        .clone()
                        .with_file(&file.path)
                        .with_dwarf_file(&dwarf_file_for(&file.path))
                        .with_type_library(&type_library_for(
                            &file.path,
                            &discovery.type_library_extension,
                        ));
                    template.render(&file_ctx, &request.build_dir)
                },
                request.max_parallel,
            )
            .await?;
        for (index, (_, outcome)) in ready.into_iter().zip(processed) {
            outcomes[index] = Some(outcome);
        }

        let results = artifacts
            .into_iter()
            .zip(outcomes)
            .filter_map(|(artifact, outcome)| outcome.map(|outcome| (artifact, outcome)))
            .collect();
        self.record_files(Stage::ExtractTypes, results, exec)
    }

    fn record_files(
        &self,
        stage: Stage,
        results: Vec<(FileMatch, StageOutcome)>,
        exec: &mut Execution,
    ) -> HarvestResult<()> {
        let total = results.len();
        let mut failed = 0;
        for (file, outcome) in results {
            if outcome.is_failure() {
                failed += 1;
            }
            exec.report.record_file(stage, &file.path, outcome)?;
        }
        // Per-file failures fail the stage without aborting the run.
        let outcome = if failed > 0 {
            StageOutcome::failure(format!("{} of {} files failed", failed, total))
        } else {
            StageOutcome::Success
        };
        exec.report.record_stage(stage, outcome)?;
        telemetry::emit_stage_finished(&exec.run_id, stage, total, failed);
        Ok(())
    }
}
