//! Environment worker process entry point.
//!
//! Runs inside the child launched by
//! [`EnvProcessController::spawn`](super::process::EnvProcessController::spawn).
//! Reads [`WireRequest`] lines from stdin, executes them sequentially against
//! the environment and writes [`WireReply`] lines to stdout. Stdout carries
//! nothing but protocol lines; logs go to stderr.
//!
//! Construction happens before anything else: on failure the worker posts a
//! `{id: null, error}` handshake and exits, on success a `{id: null, ok}`
//! ready line. After that, exactly one reply per request id, in execution
//! order. EOF on stdin is the close sentinel — the environment is shut down
//! on the way out even when no explicit close request arrived.

use crate::dispatch::CommandTarget;
use crate::env::wire::{write_message, WireOutcome, WireReply, WireRequest};
use crate::env::EnvTarget;
use crate::error::{RemoteFailure, FAILURE_KIND_CONSTRUCTION, FAILURE_KIND_INVOCATION};
use crate::registry::ConfigRegistry;
use anyhow::{Context, Result};
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Build the environment named by the configuration and serve the command
/// loop until a close request or EOF.
pub fn run(config_path: &Path, env_id: &str) -> Result<()> {
    let mut stdout = io::stdout().lock();

    let target = match prepare(config_path, env_id) {
        Ok(target) => {
            write_message(
                &mut stdout,
                &WireReply {
                    id: None,
                    outcome: WireOutcome::Ok(Value::Null),
                },
            )
            .context("failed to write ready handshake")?;
            target
        }
        Err(error) => {
            let failure = RemoteFailure::from_error(FAILURE_KIND_CONSTRUCTION, &error);
            write_message(
                &mut stdout,
                &WireReply {
                    id: None,
                    outcome: WireOutcome::Err(failure),
                },
            )
            .context("failed to write construction failure")?;
            return Err(error);
        }
    };

    info!(env = %env_id, "environment constructed, serving commands");
    serve(target, &mut stdout)
}

fn prepare(config_path: &Path, env_id: &str) -> Result<EnvTarget> {
    let registry = ConfigRegistry::new();
    let settings = registry
        .load(env_id, config_path)
        .with_context(|| format!("failed to load configuration from {config_path:?}"))?;
    let env = settings
        .environment
        .build(env_id)
        .context("failed to construct the environment")?;
    EnvTarget::new(env)
}

fn serve(mut target: EnvTarget, stdout: &mut impl Write) -> Result<()> {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read command pipe")?;
        if line.trim().is_empty() {
            continue;
        }
        let request: WireRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(error) => {
                warn!(error = %error, "discarding unparseable command line");
                continue;
            }
        };
        match request {
            WireRequest::Call { id, request } => {
                let outcome = match target.invoke(request) {
                    Ok(value) => WireOutcome::Ok(value),
                    Err(error) => {
                        debug!(id, error = %error, "command failed");
                        WireOutcome::Err(RemoteFailure::from_error(FAILURE_KIND_INVOCATION, &error))
                    }
                };
                write_message(
                    stdout,
                    &WireReply {
                        id: Some(id),
                        outcome,
                    },
                )
                .context("failed to write command reply")?;
            }
            WireRequest::Close { id } => {
                info!(id, "close requested, shutting environment down");
                let outcome = match target.on_close() {
                    Ok(value) => WireOutcome::Ok(value),
                    Err(error) => {
                        WireOutcome::Err(RemoteFailure::from_error(FAILURE_KIND_INVOCATION, &error))
                    }
                };
                write_message(
                    stdout,
                    &WireReply {
                        id: Some(id),
                        outcome,
                    },
                )
                .context("failed to write close reply")?;
                return Ok(());
            }
        }
    }

    // EOF without an explicit close request: the closed pipe is the
    // sentinel, so the environment is still shut down cleanly.
    info!("command pipe closed, shutting environment down");
    if let Err(error) = target.on_close() {
        warn!(error = %error, "environment close failed during EOF shutdown");
    }
    Ok(())
}
