//! Wire protocol between the controller and the environment worker process.
//!
//! Two unidirectional pipes cross the process boundary: requests flow
//! controller→worker over the child's stdin, replies flow worker→controller
//! over the child's stdout. Every message is one line of JSON.
//!
//! Replies carry the task id they resolve. A reply with `id: null` is the
//! construction handshake: `Ok` means the environment was built and the
//! worker is serving, `Err` means construction failed and the worker exited.
//! Errors travel as [`RemoteFailure`] records — native error types are never
//! assumed serializable.

use crate::error::RemoteFailure;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;

use super::EnvRequest;

/// Controller → worker message.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub(crate) enum WireRequest {
    /// Execute one environment command and reply with its outcome under
    /// `id`.
    Call { id: u64, request: EnvRequest },
    /// Close the environment, reply under `id`, then exit the worker loop.
    Close { id: u64 },
}

/// Worker → controller message.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub(crate) struct WireReply {
    /// Task id this reply resolves; `None` marks the construction
    /// handshake.
    pub id: Option<u64>,
    pub outcome: WireOutcome,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub(crate) enum WireOutcome {
    Ok(Value),
    Err(RemoteFailure),
}

/// Serialize one message and write it as a single line.
pub(crate) fn write_message<T: Serialize>(sink: &mut impl Write, message: &T) -> std::io::Result<()> {
    let mut line = serde_json::to_string(message).map_err(std::io::Error::other)?;
    line.push('\n');
    sink.write_all(line.as_bytes())?;
    sink.flush()
}
