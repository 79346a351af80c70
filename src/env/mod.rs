//! Environment contract and the command shape dispatched against it.
//!
//! An *environment* is the external collaborator wrapping a hardware session
//! or dataset replay: plain, possibly slow, blocking methods for lifecycle
//! (`start`/`stop`/`close`), settings (`set`/`get_settings`) and the data
//! stream (`stream`/`get_stream_metadata`). The control core never calls an
//! environment directly from the UI thread; commands flow through a
//! [`Dispatcher`](crate::dispatch::Dispatcher) (same process, see
//! [`controller`]) or across a process boundary (see [`process`]).
//!
//! Commands are an explicit, closed shape — the [`EnvRequest`] enum — not a
//! dynamic "any unknown method becomes a remote call" scheme. `set` actions
//! are validated against the capability list obtained from `get_settings()`
//! before they reach the environment.

pub mod controller;
pub mod mock;
pub mod process;
pub(crate) mod wire;
pub mod worker;

use crate::dispatch::CommandTarget;
use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Identifier of one environment instance.
pub type EnvId = String;

/// One array-like output of a streamed frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameArray {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

/// One streamed sample: the tuple of outputs the environment produced for a
/// single acquisition event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    /// Monotonic sequence number assigned by the producer.
    pub seq: u64,
    pub outputs: Vec<FrameArray>,
}

/// Shape/type description of one stream output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputMetadata {
    pub shape: Vec<usize>,
    pub dtype: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub unit: Option<String>,
}

/// Description of the whole stream, one entry per frame output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamMetadata {
    pub outputs: Vec<OutputMetadata>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sampling_frequency_hz: Option<f64>,
}

/// Callback invoked with every published frame, on the producer's
/// acquisition thread. Must be non-blocking — O(1)-ish work only.
pub type FrameCallback = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Fan-out point between one producer (the environment's acquisition
/// thread) and its consumers (live display, capture session).
///
/// `publish` snapshots the callback list and invokes the callbacks outside
/// the lock, so a subscriber registering concurrently never deadlocks the
/// producer.
#[derive(Default)]
pub struct StreamHub {
    callbacks: Mutex<Vec<FrameCallback>>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for every future frame.
    pub fn subscribe(&self, callback: FrameCallback) {
        self.callbacks.lock().push(callback);
    }

    /// Deliver one frame to every registered callback.
    pub fn publish(&self, frame: &Frame) {
        let snapshot: Vec<FrameCallback> = self.callbacks.lock().clone();
        for callback in snapshot {
            callback(frame);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.lock().len()
    }
}

/// A named setting change, e.g. `{"name": "voltage", "value": 30.0}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetAction {
    pub name: String,
    pub value: Value,
}

impl SetAction {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One entry of the capability list an environment exposes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettingDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max: Option<f64>,
}

/// The closed set of commands that can be dispatched against an environment.
///
/// Every variant maps onto one [`Environment`] method with one JSON return
/// value. Unknown commands cannot be expressed; unknown `set` targets are
/// rejected against the capability list before invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum EnvRequest {
    Start,
    Stop,
    Set(SetAction),
    GetSettings,
    GetStreamMetadata,
}

/// The environment contract implemented by hardware/dataset collaborators.
///
/// Methods are plain blocking calls; the single dispatch worker serializes
/// them, so implementations need not be thread-safe against their own
/// command methods. Only the stream runs concurrently with commands, on the
/// environment's own acquisition thread.
pub trait Environment: Send {
    /// Identifier of this environment instance.
    fn id(&self) -> &str;

    /// Begin producing frames on the acquisition thread.
    fn start(&mut self) -> Result<()>;

    /// Stop producing frames; the environment stays usable.
    fn stop(&mut self) -> Result<()>;

    /// Release the underlying session. Called exactly once, at shutdown.
    fn close(&mut self) -> Result<()>;

    /// Apply a setting change, returning the applied value.
    fn set(&mut self, action: &SetAction) -> Result<Value>;

    /// The capability list: which settings exist and their ranges.
    fn get_settings(&self) -> Result<Vec<SettingDescriptor>>;

    /// The fan-out point frames are published through.
    fn stream(&self) -> Arc<StreamHub>;

    /// Shape/type description of the frames this environment produces.
    fn get_stream_metadata(&self) -> Result<StreamMetadata>;
}

/// Adapter executing [`EnvRequest`]s against a boxed environment.
///
/// Used by both dispatch variants: the same-process controller installs it
/// as its worker target, and the out-of-process worker drives it from the
/// wire loop. Construction caches the capability list so `set` validation
/// does not re-query the environment per command.
pub struct EnvTarget {
    env: Box<dyn Environment>,
    capabilities: HashSet<String>,
}

impl EnvTarget {
    pub fn new(env: Box<dyn Environment>) -> Result<Self> {
        let capabilities = env
            .get_settings()?
            .into_iter()
            .map(|descriptor| descriptor.name)
            .collect();
        Ok(Self { env, capabilities })
    }

    pub fn stream(&self) -> Arc<StreamHub> {
        self.env.stream()
    }
}

impl CommandTarget for EnvTarget {
    type Request = EnvRequest;

    fn invoke(&mut self, request: EnvRequest) -> Result<Value> {
        match request {
            EnvRequest::Start => {
                self.env.start()?;
                Ok(Value::Null)
            }
            EnvRequest::Stop => {
                self.env.stop()?;
                Ok(Value::Null)
            }
            EnvRequest::Set(action) => {
                if !self.capabilities.contains(&action.name) {
                    bail!(
                        "environment '{}' has no setting named '{}'",
                        self.env.id(),
                        action.name
                    );
                }
                self.env.set(&action)
            }
            EnvRequest::GetSettings => Ok(serde_json::to_value(self.env.get_settings()?)?),
            EnvRequest::GetStreamMetadata => {
                Ok(serde_json::to_value(self.env.get_stream_metadata()?)?)
            }
        }
    }

    fn on_close(&mut self) -> Result<Value> {
        self.env.close()?;
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn stream_hub_fans_out_to_every_subscriber() {
        let hub = StreamHub::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        for counter in [&first, &second] {
            let counter = Arc::clone(counter);
            hub.subscribe(Arc::new(move |_frame| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let frame = Frame {
            seq: 0,
            outputs: vec![],
        };
        hub.publish(&frame);
        hub.publish(&frame);

        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 2);
        assert_eq!(hub.subscriber_count(), 2);
    }

    #[test]
    fn env_request_round_trips_through_json() {
        let request = EnvRequest::Set(SetAction::new("voltage", serde_json::json!(30.0)));
        let json = serde_json::to_string(&request).expect("serialize");
        let back: EnvRequest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(request, back);
    }
}
