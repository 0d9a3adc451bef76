//! fort-gym CLI
//!
//! The `fortgym` command drives agents through the fortress simulation.
//!
//! ## Commands
//!
//! - `run`: drive a single run to completion
//! - `job`: run N copies of a run spec with bounded parallelism
//! - `replay`: verify a persisted trace and print its digest
//! - `list`: list runs found in the artifacts directory

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn, Level};

use fortgym_core::{
    CancellationFlag, JobState, JsonlTraceStore, Orchestrator, RunId, RunSpec, Settings,
    TraceStore,
};

#[derive(Parser)]
#[command(name = "fortgym")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run orchestration engine for fortress-simulation agents", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// TOML settings file
    #[arg(long, global = true, env = "FORT_GYM_CONFIG")]
    config: Option<PathBuf>,

    /// Root directory for traces and summaries
    #[arg(long, global = true, env = "FORT_GYM_ARTIFACTS_DIR")]
    artifacts_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct SpecArgs {
    /// Backend name
    #[arg(long, default_value = "mock")]
    backend: String,

    /// Agent name (fake, cycle)
    #[arg(long, default_value = "fake")]
    model: String,

    /// Maximum committed steps per run
    #[arg(long, default_value = "10")]
    max_steps: u64,

    /// Ticks advanced after each step (default from settings)
    #[arg(long)]
    ticks_per_step: Option<u32>,

    /// Seed for the mock backend (default from settings)
    #[arg(long)]
    seed: Option<u64>,
}

impl SpecArgs {
    fn spec(&self) -> RunSpec {
        let spec = RunSpec::new(self.backend.clone(), self.model.clone(), self.max_steps);
        match self.ticks_per_step {
            Some(ticks) => spec.with_ticks_per_step(ticks),
            None => spec,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Drive a single run to completion
    Run {
        #[command(flatten)]
        spec: SpecArgs,

        /// Stream run events to stdout as JSON lines
        #[arg(long)]
        follow: bool,
    },

    /// Run several copies of a run spec with bounded parallelism
    Job {
        #[command(flatten)]
        spec: SpecArgs,

        /// Number of runs
        #[arg(short = 'n', long, default_value = "4")]
        runs: usize,

        /// Runs driven at the same time
        #[arg(short, long, default_value = "2")]
        parallelism: usize,
    },

    /// Verify a persisted trace and print its digest
    Replay {
        /// Run ID to replay
        #[arg(long)]
        run: String,

        /// Write the step records to this file as JSON lines
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List runs in the artifacts directory
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    fortgym_core::init_tracing(cli.json, level);

    let mut settings =
        Settings::load(cli.config.as_deref()).context("Failed to load fort-gym settings")?;
    if let Some(dir) = cli.artifacts_dir {
        settings.artifacts_dir = dir;
    }

    match cli.command {
        Commands::Run { spec, follow } => cmd_run(settings, &spec, follow).await.map(|_| ()),
        Commands::Job {
            spec,
            runs,
            parallelism,
        } => cmd_job(settings, &spec, runs, parallelism).await,
        Commands::Replay { run, output } => cmd_replay(settings, &run, output.as_deref()).await,
        Commands::List => cmd_list(settings).await,
    }
}

fn orchestrator(mut settings: Settings, spec: Option<&SpecArgs>) -> Result<Orchestrator> {
    if let Some(seed) = spec.and_then(|s| s.seed) {
        settings.mock_seed = seed;
    }
    std::fs::create_dir_all(&settings.artifacts_dir).with_context(|| {
        format!(
            "Failed to create artifacts directory {:?}",
            settings.artifacts_dir
        )
    })?;
    let store: Arc<dyn TraceStore> = Arc::new(JsonlTraceStore::new(&settings.artifacts_dir));
    Ok(Orchestrator::new(settings, store))
}

/// Cancel `flag` on Ctrl-C.
fn cancel_on_ctrl_c(flag: CancellationFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping at the next step boundary");
            flag.cancel();
        }
    });
}

/// Drive a single run to completion and print its final state.
async fn cmd_run(settings: Settings, args: &SpecArgs, follow: bool) -> Result<RunId> {
    let o = orchestrator(settings, Some(args))?;
    let mut engine = o
        .build_engine(&args.spec())
        .context("Failed to create run")?;
    let run_id = engine.run_id().clone();
    info!(run_id = %run_id, "run created");

    let printer = if follow {
        let mut sub = o
            .subscribe(&run_id)
            .context("Run has no event stream")?;
        Some(tokio::spawn(async move {
            while let Some(event) = sub.next().await {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "failed to encode event"),
                }
            }
        }))
    } else {
        None
    };

    let cancel = CancellationFlag::new();
    cancel_on_ctrl_c(cancel.clone());
    let run = engine.run(&cancel).await;

    if let Some(printer) = printer {
        printer.await.context("Event printer task failed")?;
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&run).context("Failed to encode run")?
    );
    Ok(run_id)
}

/// Run `n` copies of a run spec and print the job status.
async fn cmd_job(settings: Settings, args: &SpecArgs, n: usize, parallelism: usize) -> Result<()> {
    let o = Arc::new(orchestrator(settings, Some(args))?);
    let job_id = o
        .start_job(&args.spec(), n, parallelism)
        .context("Failed to start job")?;
    info!(job_id = %job_id, runs = n, parallelism, "job started");

    {
        let o = Arc::clone(&o);
        let job_id = job_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(job_id = %job_id, "interrupt received; cancelling job");
                if let Err(e) = o.cancel_job(&job_id) {
                    warn!(error = %e, "cancel failed");
                }
            }
        });
    }

    let status = o.wait_job(&job_id).await.context("Failed to wait for job")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&status).context("Failed to encode job status")?
    );
    if status.state == JobState::Cancelled {
        warn!(job_id = %job_id, cancelled = status.cancelled, "job was cancelled");
    }
    Ok(())
}

/// Verify a persisted trace and print its replay summary.
async fn cmd_replay(settings: Settings, run_id: &str, output: Option<&Path>) -> Result<()> {
    let o = orchestrator(settings, None)?;
    let run_id = RunId::from(run_id);
    let (records, summary) = o
        .replay(&run_id)
        .await
        .with_context(|| format!("Failed to replay run {run_id}"))?;

    if let Some(path) = output {
        let mut lines = String::new();
        for record in &records {
            lines.push_str(&serde_json::to_string(record).context("Failed to encode record")?);
            lines.push('\n');
        }
        std::fs::write(path, lines)
            .with_context(|| format!("Failed to write replay output to {:?}", path))?;
        println!("Replayed run {} to {:?}", run_id, path);
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("Failed to encode replay summary")?
    );
    if summary.summary_consistent == Some(false) {
        warn!(run_id = %run_id, "stored summary disagrees with the trace");
    }
    println!("Replay digest: {}", summary.digest);
    Ok(())
}

/// List runs with their stored status.
async fn cmd_list(settings: Settings) -> Result<()> {
    let o = orchestrator(settings, None)?;
    let runs = o.store().list_runs().await.context("Failed to list runs")?;

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    for run_id in runs {
        match o.store().load_summary(&run_id).await? {
            Some(s) => println!(
                "{}  {:<9}  steps={:<4} score={:<7.2} {}/{}",
                run_id, s.status, s.steps, s.final_score, s.backend, s.model
            ),
            None => println!("{}  (no summary)", run_id),
        }
    }
    Ok(())
}
