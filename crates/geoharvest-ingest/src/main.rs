//! geoharvest - resumable geospatial ingestion

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use geoharvest_common::logging::{init_logging, LogConfig, LogLevel};
use geoharvest_common::{Stage, UnitKey};
use geoharvest_ingest::config::PipelineConfig;
use geoharvest_ingest::pipeline::{report, Pipeline};
use geoharvest_ingest::stage::StageReport;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "geoharvest")]
#[command(author, version, about = "Resumable geospatial dataset ingestion and merge")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "GEOHARVEST_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download every unit listed in the manifest
    Fetch,

    /// Unpack downloaded archives
    Extract,

    /// Convert extracted shapefiles
    Convert,

    /// Merge converted layers by group
    Merge {
        /// Groups to merge (default: configured list, else every observed group)
        #[arg(long, value_delimiter = ',')]
        groups: Vec<String>,
    },

    /// Run fetch, extract, convert and merge in order
    Run,

    /// Show checkpoint counts per stage
    Status,

    /// Clear checkpoints so units run again
    Invalidate {
        /// Stage to invalidate
        #[arg(long)]
        stage: Stage,

        /// Only units at or under this key
        #[arg(long)]
        prefix: Option<String>,

        /// Also delete the artifacts those checkpoints recorded
        #[arg(long)]
        delete_artifacts: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("geoharvest")
        .build();
    let log_config = log_config.clone().with_env_overrides().unwrap_or(log_config);

    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        },
    };

    match execute(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        },
    }
}

/// Returns `false` when the command finished but some units failed
async fn execute(cli: Cli) -> Result<bool> {
    let mut config = PipelineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Command::Merge { groups } = &cli.command {
        if !groups.is_empty() {
            config.merge.groups = Some(groups.clone());
        }
    }

    let pipeline = Pipeline::from_config(config)?.with_progress(std::io::stderr().is_terminal());

    let stop = pipeline.stop_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight units");
            stop.store(true, Ordering::SeqCst);
        }
    });

    match cli.command {
        Command::Fetch => run_one(&pipeline, Stage::Fetch).await,
        Command::Extract => run_one(&pipeline, Stage::Extract).await,
        Command::Convert => run_one(&pipeline, Stage::Convert).await,
        Command::Merge { .. } => run_one(&pipeline, Stage::Merge).await,
        Command::Run => {
            let reports = pipeline.run_all().await?;
            Ok(print_reports(&reports))
        },
        Command::Status => {
            let rows = pipeline.status().await?;
            println!("{}", report::status_table(&rows));
            Ok(true)
        },
        Command::Invalidate {
            stage,
            prefix,
            delete_artifacts,
            yes,
        } => invalidate(&pipeline, stage, prefix.as_deref(), delete_artifacts, yes).await,
    }
}

async fn run_one(pipeline: &Pipeline, stage: Stage) -> Result<bool> {
    let report = pipeline.run_stage(stage).await?;
    Ok(print_reports(std::slice::from_ref(&report)))
}

fn print_reports(reports: &[StageReport]) -> bool {
    println!("{}", report::stage_table(reports));
    if let Some(problems) = report::problem_table(reports) {
        println!("{}", problems);
    }
    reports.iter().all(StageReport::is_clean)
}

async fn invalidate(
    pipeline: &Pipeline,
    stage: Stage,
    prefix: Option<&str>,
    delete_artifacts: bool,
    yes: bool,
) -> Result<bool> {
    let prefix = prefix.map(UnitKey::parse).transpose()?;

    if delete_artifacts && !yes {
        let artifacts = pipeline.recorded_artifacts(stage, prefix.as_ref()).await?;
        let message = format!(
            "Delete {} {} artifact(s) under {}?",
            artifacts.len(),
            stage,
            prefix.as_ref().map(|p| p.as_str()).unwrap_or("every unit"),
        );
        let confirmed = inquire::Confirm::new(&message)
            .with_default(false)
            .prompt()
            .context("confirmation prompt")?;
        if !confirmed {
            info!("Invalidation cancelled");
            return Ok(true);
        }
    }

    let outcome = pipeline
        .invalidate(stage, prefix.as_ref(), delete_artifacts)
        .await?;

    println!(
        "Removed {} checkpoint(s) and {} artifact(s) for {}",
        outcome.records_removed, outcome.artifacts_removed, stage
    );
    for path in &outcome.artifacts_failed {
        eprintln!("Could not delete {}", path.display());
    }

    Ok(outcome.artifacts_failed.is_empty())
}
