//! Same-process environment controller.
//!
//! Owns one [`Dispatcher`] whose worker thread constructs and then
//! exclusively owns the environment. Construction is part of the worker
//! startup: if the environment factory fails, the failure is handed back and
//! this constructor fails too — a controller either exists fully working or
//! not at all, and no worker thread is left behind serving a dead
//! environment.
//!
//! Commands return a [`Promise`] immediately (non-blocking submission); the
//! caller decides when to block on the outcome. The live data stream is not
//! dispatched — the [`StreamHub`] is shared directly, because frames are
//! produced on the environment's acquisition thread and consumed through
//! registered callbacks.

use crate::dispatch::{Dispatcher, Promise};
use crate::env::{EnvId, EnvRequest, EnvTarget, Environment, SetAction, StreamHub};
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tracing::info;

/// Blocking-looking front end over one environment running on a dispatch
/// worker thread.
pub struct EnvController {
    id: EnvId,
    dispatcher: Dispatcher<EnvRequest>,
    stream: Arc<StreamHub>,
}

impl EnvController {
    /// Construct the environment on the worker thread and start serving
    /// commands.
    ///
    /// `factory` runs on the worker thread, so a slow or hardware-touching
    /// construction never blocks anything but its own controller's
    /// constructor, which waits for the ready handshake.
    pub fn new<F>(id: impl Into<EnvId>, factory: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Box<dyn Environment>> + Send + 'static,
    {
        let id = id.into();
        let (dispatcher, ready) = Dispatcher::spawn_with(&id, move || {
            let env = factory()?;
            let target = EnvTarget::new(env)?;
            let stream = target.stream();
            Ok((target, stream))
        })
        .context("failed to spawn environment dispatch worker")?;

        let stream = ready
            .blocking_recv()
            .map_err(|_| anyhow!("environment worker died during construction"))?
            .with_context(|| format!("environment '{id}' did not start properly"))?;

        info!(id = %id, "environment is ready");
        Ok(Self {
            id,
            dispatcher,
            stream,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Begin streaming. Resolves once the environment's `start()` returned.
    pub fn start(&self) -> Promise {
        self.dispatcher.send(EnvRequest::Start)
    }

    /// Stop streaming without releasing the environment.
    pub fn stop(&self) -> Promise {
        self.dispatcher.send(EnvRequest::Stop)
    }

    /// Apply a setting change. Unknown settings are rejected against the
    /// capability list and surface as a promise error.
    pub fn set(&self, action: SetAction) -> Promise {
        self.dispatcher.send(EnvRequest::Set(action))
    }

    /// Fetch the capability list.
    pub fn get_settings(&self) -> Promise {
        self.dispatcher.send(EnvRequest::GetSettings)
    }

    /// Fetch the stream shape/type description.
    pub fn get_stream_metadata(&self) -> Promise {
        self.dispatcher.send(EnvRequest::GetStreamMetadata)
    }

    /// Direct access to the frame fan-out; not dispatched.
    pub fn stream(&self) -> Arc<StreamHub> {
        Arc::clone(&self.stream)
    }

    /// Flow the close sentinel through the queue. The promise resolves with
    /// the environment's own `close()` result once every previously
    /// submitted command has executed.
    pub fn close(&self) -> Promise {
        self.dispatcher.close()
    }

    /// Join the worker thread after `close()` has resolved.
    pub fn join(&mut self) {
        self.dispatcher.join();
    }
}
