//! `axisweep` -- parameter sweeps against a ComfyUI server.
//!
//! ```text
//! axisweep -c sweep.yaml sweep [--dry-run] [--yes] [--progress] [--reset] [--forget AXIS]
//! axisweep -c batch.yaml images --images-dir DIR [--recursive] [--limit N] [--dry-run] [--yes]
//! ```
//!
//! # Exit codes
//!
//! | Code | Meaning                                                   |
//! |------|-----------------------------------------------------------|
//! | `0`  | success, nothing left to do, or declined at the prompt    |
//! | `1`  | unexpected failure                                        |
//! | `2`  | invalid configuration, workflow or images directory       |
//! | `3`  | ComfyUI server unreachable                                |

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use axisweep_comfyui::client::ComfyUIClient;
use axisweep_core::config::Config;
use axisweep_core::error::CoreError;
use axisweep_core::exploration::ExplorationProgress;
use axisweep_pipeline::image_batch::{ImageBatchOptions, ImageBatchRunner};
use axisweep_pipeline::progress::RunSummary;
use axisweep_pipeline::sweep::AxisSweepRunner;
use axisweep_pipeline::PipelineError;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_UNREACHABLE: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "axisweep", about = "Workflow parameter sweeps for ComfyUI")]
struct Cli {
    /// Sweep configuration (YAML or JSON).
    #[arg(short, long, global = true, default_value = "config/config.yaml")]
    config: PathBuf,
    /// Debug-level logging.
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Also append logs to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Explore the next unexplored prompt axis.
    Sweep(SweepArgs),
    /// Run the expression workflow over a directory of images.
    Images(ImagesArgs),
}

#[derive(Args, Debug)]
struct SweepArgs {
    /// Write metadata but submit nothing; the axis is not marked explored.
    #[arg(long)]
    dry_run: bool,
    /// Print exploration progress and exit.
    #[arg(short, long)]
    progress: bool,
    /// Skip the confirmation prompt.
    #[arg(short, long)]
    yes: bool,
    /// Clear the exploration state and exit.
    #[arg(long, conflicts_with = "forget")]
    reset: bool,
    /// Remove one axis from the exploration state and exit.
    #[arg(long, value_name = "AXIS")]
    forget: Option<String>,
    /// Sweep this axis even if it was already explored.
    #[arg(long, value_name = "AXIS")]
    axis: Option<String>,
}

#[derive(Args, Debug)]
struct ImagesArgs {
    /// Directory of input images (.png, .jpg, .jpeg, .webp).
    #[arg(long)]
    images_dir: PathBuf,
    /// Descend into subdirectories.
    #[arg(short, long)]
    recursive: bool,
    /// Process at most N images.
    #[arg(long, value_name = "N")]
    limit: Option<usize>,
    /// Write metadata but upload and submit nothing.
    #[arg(long)]
    dry_run: bool,
    /// Skip the confirmation prompt.
    #[arg(short, long)]
    yes: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.verbose, cli.log_file.as_deref()) {
        eprintln!("Failed to set up logging: {e:#}");
        return ExitCode::from(EXIT_FAILURE);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "axisweep failed");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn init_tracing(verbose: bool, log_file: Option<&Path>) -> anyhow::Result<()> {
    let default_filter = if verbose {
        "axisweep=debug"
    } else {
        "axisweep=info"
    };

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<PipelineError>() {
        if e.is_unreachable() {
            return EXIT_UNREACHABLE;
        }
        if e.is_config() {
            return EXIT_CONFIG;
        }
    }
    if let Some(e) = err.downcast_ref::<CoreError>() {
        if e.is_config() {
            return EXIT_CONFIG;
        }
    }
    EXIT_FAILURE
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(&cli.config)?;
    let client = ComfyUIClient::new(
        &config.server.url,
        Duration::from_secs(config.server.request_timeout_secs),
    )?;

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone(), client.clone());

    match cli.command {
        Command::Sweep(args) => run_sweep(config, client, args, &cancel).await,
        Command::Images(args) => run_images(config, client, args, &cancel).await,
    }
}

/// First Ctrl-C stops launching new submissions; the remote job that is
/// running keeps running. A second Ctrl-C also interrupts that job.
fn spawn_interrupt_handler(cancel: CancellationToken, client: ComfyUIClient) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::warn!(
            "Interrupt received, finishing up (Ctrl-C again to stop the running job)"
        );
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            let outcome = client.interrupt().await;
            match outcome.error_message {
                None => tracing::warn!("Interrupted the job running on the server"),
                Some(error) => tracing::error!(error = %error, "Failed to interrupt the server"),
            }
        }
    });
}

/// Number of running and pending entries in a `/queue` body.
fn queue_counts(body: &Value) -> (usize, usize) {
    let len = |key: &str| body.get(key).and_then(Value::as_array).map_or(0, Vec::len);
    (len("queue_running"), len("queue_pending"))
}

/// Print how busy the server is before asking to add to its queue.
async fn report_queue(client: &ComfyUIClient) {
    let outcome = client.queue().await;
    match &outcome.data {
        Some(body) if outcome.success => {
            let (running, pending) = queue_counts(body);
            println!("Server queue: {running} running, {pending} pending");
        }
        _ => tracing::debug!(
            error = outcome.error_message.as_deref().unwrap_or_default(),
            "Could not read the server queue"
        ),
    }
}

async fn run_sweep(
    config: Config,
    client: ComfyUIClient,
    args: SweepArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let server = client.clone();
    let mut runner = AxisSweepRunner::new(config, client, args.dry_run)?;

    if args.reset {
        runner.state_mut().reset()?;
        println!("Exploration state cleared");
        return Ok(());
    }
    if let Some(axis) = &args.forget {
        runner.state_mut().remove(axis)?;
        print_progress(&runner.progress(), runner.state().used_axes());
        return Ok(());
    }

    print_progress(&runner.progress(), runner.state().used_axes());
    if args.progress {
        return Ok(());
    }

    runner.preflight().await?;
    if !args.dry_run {
        report_queue(&server).await;
    }
    let plan = match &args.axis {
        Some(axis) => runner.plan_for(axis)?,
        None => match runner.plan()? {
            Some(plan) => plan,
            None => {
                println!("Every axis has been explored. Use --reset to start over.");
                return Ok(());
            }
        },
    };

    let question = format!(
        "Sweep axis '{}': {} combinations x {} repeats = {} runs. Continue?",
        plan.target_axis,
        plan.combinations,
        plan.repeats,
        plan.total_runs()
    );
    if !args.yes && !confirm(&question)? {
        println!("Cancelled");
        return Ok(());
    }

    let summary = runner.execute(&plan, cancel).await?;
    print_summary(&summary)
}

async fn run_images(
    config: Config,
    client: ComfyUIClient,
    args: ImagesArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let options = ImageBatchOptions {
        images_dir: args.images_dir,
        recursive: args.recursive,
        limit: args.limit,
        dry_run: args.dry_run,
    };
    let server = client.clone();
    let runner = ImageBatchRunner::new(config, client, options)?;

    let plan = runner.plan()?;
    if plan.images.is_empty() {
        println!("No images found in {}", runner.options().images_dir.display());
        return Ok(());
    }
    runner.preflight().await?;
    if !args.dry_run {
        report_queue(&server).await;
    }

    let question = format!(
        "{} images x {} expressions x {} sampler settings x {} repeats = {} runs. Continue?",
        plan.images.len(),
        plan.expressions,
        plan.sampler_combinations,
        plan.repeats,
        plan.total_runs()
    );
    if !args.yes && !confirm(&question)? {
        println!("Cancelled");
        return Ok(());
    }

    let summary = runner.execute(&plan, cancel).await?;
    print_summary(&summary)
}

fn confirm(question: &str) -> anyhow::Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn print_progress<'a>(progress: &ExplorationProgress, used: impl Iterator<Item = &'a str>) {
    println!(
        "Explored {}/{} axes ({:.1}%)",
        progress.used_count, progress.total_count, progress.percentage
    );
    let used: Vec<&str> = used.collect();
    if !used.is_empty() {
        println!("  used:      {}", used.join(", "));
    }
    if !progress.remaining.is_empty() {
        println!("  remaining: {}", progress.remaining.join(", "));
    }
}

fn print_summary(summary: &RunSummary) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}
