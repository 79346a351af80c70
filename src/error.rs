//! Custom error types for the control core.
//!
//! Each concern of the core carries its own error enum, built with the
//! `thiserror` crate. Keeping the taxonomies separate (instead of one
//! application-wide enum) matches how the errors propagate:
//!
//! - **`StateMachineError`**: caller/programmer contract violations against a
//!   state graph (unknown state, action not legal in the current state, wrong
//!   lifecycle phase). Surfaced synchronously to the direct caller, never
//!   retried.
//! - **`DispatchError`**: failures of asynchronously dispatched commands.
//!   These are always delivered through the command's [`Promise`] and never
//!   crash the worker loop. `RemoteInvocation` wraps whatever the invoked
//!   method raised, as a transportable [`RemoteFailure`] record.
//! - **`ProcessBoundaryError`**: failures of the out-of-process environment
//!   variant. `ConstructionFailed` is fatal to the controller being built;
//!   `Timeout` is logged and treated as best-effort during shutdown.
//! - **`BufferError`**: misuse of the bounded capture buffer.
//! - **`ConfigError`**: configuration loading and semantic validation
//!   failures, split the same way as parsing vs. validation.
//!
//! Command-level errors cross thread and process boundaries. Native error
//! types cannot be assumed serializable, so the worker side converts any
//! failure into a `RemoteFailure { kind, message, detail }` record and the
//! controller reconstructs a local `DispatchError` from it.
//!
//! [`Promise`]: crate::dispatch::Promise

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by [`StateGraph`](crate::state_graph::StateGraph) and
/// [`StateGraphIterator`](crate::state_graph::StateGraphIterator).
///
/// State and action ids are recorded in their `Debug` rendering so the enum
/// stays independent of the graph's id types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("there is no state with id {state}")]
    StateNotFound { state: String },

    #[error("the action '{action}' is not available in state '{state}'")]
    ActionNotAvailable { state: String, action: String },

    #[error("there is no transition from state {from} to {to}")]
    TransitionNotFound { from: String, to: String },

    #[error("expected state {expected}, but the current state is {actual}")]
    WrongState { expected: String, actual: String },

    #[error("duplicate transition for state {state} and action {action}")]
    DuplicateTransition { state: String, action: String },
}

/// A failure converted into a transportable record.
///
/// Exceptions cannot be assumed serializable across a process boundary, so
/// the worker side flattens them into this record and the controller side
/// reconstructs a [`DispatchError::RemoteInvocation`] from it. `detail`
/// carries the error's source chain when one exists.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RemoteFailure {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<serde_json::Value>,
}

impl RemoteFailure {
    /// Flatten an `anyhow::Error` into a transportable record, keeping the
    /// source chain as detail.
    pub fn from_error(kind: &str, error: &anyhow::Error) -> Self {
        let chain: Vec<String> = error.chain().skip(1).map(|cause| cause.to_string()).collect();
        Self {
            kind: kind.to_string(),
            message: error.to_string(),
            detail: if chain.is_empty() {
                None
            } else {
                Some(serde_json::Value::from(chain))
            },
        }
    }

    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            detail: None,
        }
    }
}

/// Failure kind used for command invocation errors.
pub const FAILURE_KIND_INVOCATION: &str = "invocation";
/// Failure kind used for environment construction errors.
pub const FAILURE_KIND_CONSTRUCTION: &str = "construction";
/// Failure kind used for bounded waits that expired.
pub const FAILURE_KIND_TIMEOUT: &str = "timeout";

/// Errors delivered through a [`Promise`](crate::dispatch::Promise).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// The worker resolving this command is gone (closed, panicked, or the
    /// worker process died) before the command completed.
    #[error("command worker is no longer available")]
    WorkerUnavailable,

    /// The invoked method itself failed; the record wraps whatever it raised.
    #[error("remote invocation failed: {0}")]
    RemoteInvocation(RemoteFailure),
}

impl DispatchError {
    /// Wrap an invocation failure raised by the target method.
    pub fn from_invocation(error: &anyhow::Error) -> Self {
        Self::RemoteInvocation(RemoteFailure::from_error(FAILURE_KIND_INVOCATION, error))
    }
}

/// Errors of the out-of-process environment controller.
#[derive(Error, Debug)]
pub enum ProcessBoundaryError {
    /// The worker process failed to construct the environment. Fatal to the
    /// controller being built; no listener thread is left behind.
    #[error("environment construction failed: {0}")]
    ConstructionFailed(RemoteFailure),

    /// A bounded wait expired. Logged and treated as best-effort during
    /// shutdown, never fatal to the controller's own shutdown path.
    #[error("timed out while {operation}")]
    Timeout { operation: String },

    /// The worker binary could not be launched at all.
    #[error("failed to spawn environment worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Misuse of the bounded capture buffer. Caller errors, not retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("capture buffer is full")]
    BufferFull,

    #[error("cannot save an empty capture buffer")]
    EmptyBuffer,
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("configuration validation error: {0}")]
    Invalid(String),
}
