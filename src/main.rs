//! CLI entry point for acqctl.
//!
//! Provides two modes:
//! - `run` — headless demo session: construct the configured environment,
//!   capture one buffer of frames and persist it.
//! - `env-worker` — hidden child mode used by the process-boundary
//!   controller; speaks the wire protocol on stdin/stdout.
//!
//! # Usage
//!
//! Run a capture session in-process:
//! ```bash
//! acqctl run --config config/default.toml
//! ```
//!
//! Run the environment in an isolated worker process:
//! ```bash
//! acqctl run --config config/default.toml --isolate
//! ```

use acqctl::capture::CaptureSession;
use acqctl::config::Settings;
use acqctl::env::controller::EnvController;
use acqctl::env::process::{EnvProcessConfig, EnvProcessController};
use acqctl::env::{worker, SetAction};
use acqctl::registry::ConfigRegistry;
use acqctl::telemetry::{self, TelemetryConfig};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const ENV_ID: &str = "env_0";

#[derive(Parser)]
#[command(name = "acqctl")]
#[command(about = "Control core for streaming acquisition front ends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a headless capture session against the configured environment
    Run {
        /// Path to the TOML configuration file
        #[arg(long, default_value = "config/default.toml")]
        config: PathBuf,

        /// Where to write the captured frames
        #[arg(long, default_value = "capture.json")]
        output: PathBuf,

        /// Host the environment in an isolated worker process
        #[arg(long)]
        isolate: bool,
    },

    /// Environment worker process mode (used internally)
    #[command(hide = true)]
    EnvWorker {
        /// Path to the TOML configuration file
        #[arg(long)]
        config: PathBuf,

        /// Environment id to construct
        #[arg(long)]
        env_id: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            output,
            isolate,
        } => run_session(&config, &output, isolate),
        Commands::EnvWorker { config, env_id } => {
            telemetry::init_worker().map_err(anyhow::Error::msg)?;
            worker::run(&config, &env_id)
        }
    }
}

fn run_session(config_path: &Path, output: &Path, isolate: bool) -> Result<()> {
    let registry = ConfigRegistry::new();
    let settings = registry
        .load(ENV_ID, config_path)
        .with_context(|| format!("failed to load configuration from {config_path:?}"))?;
    telemetry::init(&TelemetryConfig::from_settings(&settings).map_err(anyhow::Error::msg)?)
        .map_err(anyhow::Error::msg)?;

    println!("acqctl - acquisition control core");
    println!(
        "  config: {} (capture capacity: {})",
        config_path.display(),
        settings.capture.capacity
    );

    if isolate {
        run_isolated(config_path, &settings)
    } else {
        run_in_process(&settings, output)
    }
}

/// In-process session: environment on a dispatch worker thread, capture fed
/// by the streaming callback.
fn run_in_process(settings: &Arc<Settings>, output: &Path) -> Result<()> {
    let env_settings = settings.environment.clone();
    let controller = EnvController::new(ENV_ID, move || env_settings.build(ENV_ID))?;

    let (session, mut progress) = CaptureSession::new(ENV_ID, settings.capture.capacity)?;
    let session = Arc::new(session);
    session.attach(&controller.stream());

    let mut metadata = controller.get_stream_metadata();
    if let Some(value) = metadata.get_result() {
        session.set_stream_metadata(serde_json::from_value(value)?);
    }

    println!("  starting environment and capturing {} frames...", settings.capture.capacity);
    controller
        .start()
        .get_error()
        .map_or(Ok(()), |error| Err(anyhow::Error::new(error)))?;
    session.start_capture()?;

    while let Some(event) = progress.blocking_recv() {
        if event.done {
            break;
        }
    }
    session.finish_capture()?;
    let written = session.save(output)?;
    println!("  capture complete: {} frames -> {}", written, output.display());

    controller
        .stop()
        .get_error()
        .map_or(Ok(()), |error| Err(anyhow::Error::new(error)))?;
    let mut close = controller.close();
    close.wait();
    Ok(())
}

/// Isolated session: the environment lives in a worker process; commands
/// cross the boundary, the stream stays on the worker side.
fn run_isolated(config_path: &Path, settings: &Arc<Settings>) -> Result<()> {
    let mut process_config = EnvProcessConfig::new(ENV_ID, config_path);
    process_config.spawn_timeout = settings.process.spawn_timeout;
    process_config.close_timeout = settings.process.close_timeout;

    let controller = EnvProcessController::spawn(process_config)?;
    println!("  worker process up, starting environment...");

    let mut started = controller.run()?;
    if let Some(error) = started.get_error() {
        controller.close()?;
        return Err(anyhow::Error::new(error));
    }

    let mut settings_promise = controller.get_settings()?;
    if let Some(value) = settings_promise.get_result() {
        println!("  remote capabilities: {value}");
    }

    // Exercise a round trip through the boundary.
    let mut applied = controller.set(SetAction::new("gain", serde_json::json!(42.0)))?;
    if let Some(value) = applied.get_result() {
        println!("  gain applied remotely: {value}");
    }

    controller.close()?;
    println!("  worker process closed");
    Ok(())
}
