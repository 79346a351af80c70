//! # acqctl — acquisition control core
//!
//! This crate is the concurrency and control core of a front end for
//! streaming hardware acquisition: it lets a UI thread issue
//! blocking-looking commands against a concurrently-running, possibly
//! crash-prone, possibly out-of-process environment without corrupting
//! shared state or hanging indefinitely. GUI rendering, the hardware
//! session itself and the signal-processing pipeline are external
//! collaborators reached only through the interfaces in [`env`].
//!
//! ## Crate Structure
//!
//! - **`state_graph`**: generic declarative state machine engine — states,
//!   actions, transitions, veto-capable enter/exit hooks and a reentrant
//!   lock per iterator. Drives both the environment lifecycle and the
//!   capture-buffer lifecycle.
//! - **`dispatch`**: the `Task`/`Promise` primitives plus the single-worker
//!   FIFO `Dispatcher` that executes commands one at a time against a
//!   target.
//! - **`env`**: the environment contract (`start`/`stop`/`close`/`set`/
//!   `get_settings`/stream), the closed `EnvRequest` command shape, the
//!   same-process `EnvController`, the out-of-process
//!   `EnvProcessController` with its wire protocol and worker loop, and a
//!   mock environment for tests and demos.
//! - **`capture`**: the bounded `CaptureBuffer`, the state-graph-driven
//!   `CaptureSession` and the persisted capture format.
//! - **`config`**: TOML settings loading and validation.
//! - **`registry`**: explicit, caller-owned registry of loaded
//!   configurations.
//! - **`telemetry`**: `tracing` subscriber setup, including the
//!   stderr-only variant for worker processes.
//! - **`error`**: the error taxonomies of all of the above.

pub mod capture;
pub mod config;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod registry;
pub mod state_graph;
pub mod telemetry;
