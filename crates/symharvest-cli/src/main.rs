//! symharvest - harvest type libraries from a source package
//!
//! The `run-pipeline` command fetches and builds a package, extracts debug
//! symbols and type libraries from every built artifact, and collects the
//! results into an output directory.
//!
//! ## Exit codes
//!
//! - `0`: the run completed, possibly with per-file failures
//! - `1`: the run was aborted by a fetch, build or collect failure
//! - `2`: invalid arguments or configuration

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, Level};

use symharvest_core::{
    HarvestConfig, Pipeline, PipelineRequest, PipelineRun, ProcessRunner, Stage, StageOutcome,
};

#[derive(Parser, Debug)]
#[command(name = "run-pipeline")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Build a package and harvest type libraries from its artifacts",
    long_about = None
)]
struct Cli {
    /// Package to fetch and build
    #[arg(long)]
    package: String,

    /// Directory the package is unpacked and built in
    #[arg(long, default_value = ".")]
    build_dir: PathBuf,

    /// Maximum number of per-file commands running at once
    #[arg(long, default_value_t = 1, value_parser = parse_parallelism)]
    max_parallel: usize,

    /// Directory collected type libraries and reports are written to
    #[arg(long)]
    output_dir: PathBuf,

    /// TOML file overriding the default tools, patterns and timeouts
    #[arg(long, env = "SYMHARVEST_CONFIG")]
    config: Option<PathBuf>,

    /// Per-file command timeout in seconds (0 disables it)
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

fn parse_parallelism(raw: &str) -> Result<usize, String> {
    let value: usize = raw
        .parse()
        .map_err(|_| format!("'{}' is not a positive integer", raw))?;
    if value == 0 {
        return Err("must be at least 1".to_string());
    }
    Ok(value)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    symharvest_core::init_tracing(cli.json, level);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn load_config(cli: &Cli) -> Result<HarvestConfig> {
    let mut config = match &cli.config {
        Some(path) => HarvestConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => HarvestConfig::default(),
    };
    if let Some(secs) = cli.timeout_secs {
        config.timeouts.file_secs = secs;
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    let request = PipelineRequest::new(&cli.package, &cli.build_dir, &cli.output_dir)
        .with_max_parallel(cli.max_parallel);

    info!(
        package = %request.package,
        build_dir = %request.build_dir.display(),
        output_dir = %request.output_dir.display(),
        "Starting pipeline"
    );

    let pipeline = Pipeline::new(config, Arc::new(ProcessRunner));
    let run = pipeline
        .run(&request)
        .await
        .context("Invalid pipeline request")?;

    print!("{}", render_summary(&run));
    if run.is_completed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}

fn render_summary(run: &PipelineRun) -> String {
    let mut out = String::new();

    if let Some(failure) = &run.failure {
        out.push_str(&format!(
            "Pipeline aborted at stage '{}': {}\n",
            failure.stage, failure.reason
        ));
        let stderr = failure.stderr.trim_end();
        if !stderr.is_empty() {
            out.push_str("--- stderr ---\n");
            out.push_str(stderr);
            out.push('\n');
        }
    } else {
        out.push_str(&format!("Pipeline completed for {}\n", run.package));
        for stage in Stage::ALL {
            if stage.is_per_file() {
                let (total, failed) = run
                    .report
                    .file_entries(stage)
                    .fold((0, 0), |(total, failed), entry| {
                        (total + 1, failed + usize::from(entry.outcome.is_failure()))
                    });
                out.push_str(&format!(
                    "  {:<22} {} files, {} failed\n",
                    stage.name(),
                    total,
                    failed
                ));
            } else {
                let outcome = run
                    .report
                    .stage_outcome(stage)
                    .map(StageOutcome::to_string)
                    .unwrap_or_else(|| "not run".to_string());
                out.push_str(&format!("  {:<22} {}\n", stage.name(), outcome));
            }
        }
        out.push_str(&format!("  collected {} type libraries\n", run.collected.len()));
        out.push_str(&format!("  {} failed files\n", run.failed_file_count()));
    }

    let warnings = run.report.warnings();
    if !warnings.is_empty() {
        out.push_str(&format!("{} warnings:\n", warnings.len()));
        for warning in warnings {
            out.push_str(&format!("  {}\n", warning));
        }
    }

    if let Some(path) = &run.report_path {
        out.push_str(&format!("Report: {}\n", path.display()));
    }
    out
}
