//! Out-of-process environment controller.
//!
//! Used when the environment must run in an isolated OS process so a driver
//! crash cannot take down the controller. The controller re-execs this
//! binary in `env-worker` mode (see [`super::worker`]) and talks to it over
//! the child's stdin/stdout pipes with the line-delimited JSON protocol in
//! [`super::wire`].
//!
//! # Threads and queues
//!
//! - Submitting threads allocate a task id and write a request line; ids
//!   come from a monotonic counter living under the same mutex as the
//!   pending table, so an insert and its id are one critical section.
//! - One dedicated **result-handler thread** reads reply lines and resolves
//!   the matching promise by id. Commands may be pipelined from several
//!   threads; the id is what keeps replies and promises paired.
//! - The worker executes commands sequentially, so per-controller FIFO
//!   ordering holds exactly as in the same-process dispatcher.
//!
//! # Lifecycle
//!
//! The child is spawned (and the environment constructed) in
//! [`EnvProcessController::spawn`]; a `{id: null, ...}` handshake reply
//! distinguishes construction failure from command failure. Afterwards the
//! controller walks a small lifecycle graph:
//!
//! ```text
//! CREATED --run--> RUNNING --close--> CLOSED
//! CREATED --close--> CLOSED   (nothing running: just change the state)
//! CLOSED  --close--> CLOSED   (keep the state)
//! ```
//!
//! `close()` from RUNNING flows a CLOSE task through the queue and awaits
//! the environment's own close result; from CREATED it simply drops the
//! stdin pipe — EOF is the close sentinel and the worker shuts the
//! environment down on its way out. Either way the child process is joined
//! first and the result-handler thread second, under bounded timeouts;
//! expiry is logged and shutdown continues.

use crate::dispatch::{recv_with_deadline, CommandOutcome, DeadlineWait, Promise};
use crate::env::wire::{write_message, WireOutcome, WireReply, WireRequest};
use crate::env::{EnvId, EnvRequest, SetAction};
use crate::error::{
    DispatchError, ProcessBoundaryError, RemoteFailure, StateMachineError,
    FAILURE_KIND_CONSTRUCTION, FAILURE_KIND_TIMEOUT,
};
use crate::state_graph::{Action, State, StateGraph, StateGraphIterator, Transition};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Lifecycle states of an out-of-process environment.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum LifecycleState {
    Created,
    Running,
    Closed,
}

/// Lifecycle actions of an out-of-process environment.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum LifecycleAction {
    Run,
    Close,
}

/// How to launch and shut down the environment worker process.
#[derive(Debug, Clone)]
pub struct EnvProcessConfig {
    /// Identifier the worker registers its environment under.
    pub env_id: EnvId,
    /// Configuration file the worker builds its environment from.
    pub config_path: PathBuf,
    /// Worker binary override; defaults to the current executable.
    pub program: Option<PathBuf>,
    /// Bound on the construction handshake.
    pub spawn_timeout: Duration,
    /// Bound on awaiting the remote close and reaping the child.
    pub close_timeout: Duration,
}

impl EnvProcessConfig {
    pub fn new(env_id: impl Into<EnvId>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            env_id: env_id.into(),
            config_path: config_path.into(),
            program: None,
            spawn_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }
}

struct PendingTable {
    next_id: u64,
    entries: HashMap<u64, oneshot::Sender<CommandOutcome>>,
}

/// Shared state between submitting threads, the result-handler thread and
/// shutdown.
struct ProcessLink {
    env_id: EnvId,
    pending: Mutex<PendingTable>,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
    close_timeout: Duration,
}

impl ProcessLink {
    /// Allocate a task id and its promise in one critical section.
    fn allocate(&self) -> (u64, Promise) {
        let (resolver, receiver) = oneshot::channel();
        let mut pending = self.pending.lock();
        let id = pending.next_id;
        pending.next_id += 1;
        pending.entries.insert(id, resolver);
        (id, Promise::new(receiver))
    }

    fn write_request(&self, request: &WireRequest) -> bool {
        match self.stdin.lock().as_mut() {
            Some(stdin) => write_message(stdin, request).is_ok(),
            None => false,
        }
    }

    fn submit(&self, request: EnvRequest) -> Promise {
        let (id, promise) = self.allocate();
        if !self.write_request(&WireRequest::Call { id, request }) {
            // Dropping the resolver settles the promise as unavailable.
            self.pending.lock().entries.remove(&id);
        }
        promise
    }

    fn submit_close(&self) -> Promise {
        let (id, promise) = self.allocate();
        if !self.write_request(&WireRequest::Close { id }) {
            self.pending.lock().entries.remove(&id);
        }
        promise
    }

    fn resolve(&self, id: u64, outcome: CommandOutcome) {
        match self.pending.lock().entries.remove(&id) {
            Some(resolver) => {
                let _ = resolver.send(outcome);
            }
            None => warn!(env = %self.env_id, id, "reply for unknown task id"),
        }
    }

    /// Settle every outstanding promise as unavailable; the worker is gone.
    fn fail_pending(&self) {
        let entries: Vec<_> = self.pending.lock().entries.drain().collect();
        for (_, resolver) in entries {
            let _ = resolver.send(Err(DispatchError::WorkerUnavailable));
        }
    }

    /// Tear the boundary down: EOF the command pipe, reap the child under
    /// the close timeout (killing on expiry), then join the result-handler
    /// thread. Idempotent.
    fn shutdown(&self) {
        *self.stdin.lock() = None;

        if let Some(mut child) = self.child.lock().take() {
            let deadline = Instant::now() + self.close_timeout;
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(env = %self.env_id, %status, "environment worker exited");
                        break;
                    }
                    Ok(None) => {
                        if Instant::now() >= deadline {
                            warn!(
                                env = %self.env_id,
                                "environment worker did not exit within {:?}; killing it",
                                self.close_timeout
                            );
                            if let Err(error) = child.kill() {
                                warn!(env = %self.env_id, error = %error, "failed to kill environment worker");
                            }
                            let _ = child.wait();
                            break;
                        }
                        thread::sleep(Duration::from_millis(20));
                    }
                    Err(error) => {
                        warn!(env = %self.env_id, error = %error, "failed to poll environment worker");
                        break;
                    }
                }
            }
        }

        if let Some(reader) = self.reader.lock().take() {
            if reader.join().is_err() {
                warn!(env = %self.env_id, "result handler thread panicked");
            }
        }

        self.fail_pending();
    }
}

/// Result-handler loop: runs on its own thread until the worker's stdout
/// closes, then settles whatever is still outstanding.
fn result_handler(
    link: Arc<ProcessLink>,
    stdout: ChildStdout,
    handshake: oneshot::Sender<Result<(), RemoteFailure>>,
) {
    let mut handshake = Some(handshake);
    let reader = BufReader::new(stdout);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(error) => {
                warn!(env = %link.env_id, error = %error, "failed to read worker reply");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply: WireReply = match serde_json::from_str(&line) {
            Ok(reply) => reply,
            Err(error) => {
                warn!(env = %link.env_id, error = %error, "discarding unparseable worker reply");
                continue;
            }
        };
        match reply.id {
            None => {
                // Construction handshake, not a command reply.
                let result = match reply.outcome {
                    WireOutcome::Ok(_) => Ok(()),
                    WireOutcome::Err(failure) => Err(failure),
                };
                match handshake.take() {
                    Some(sender) => {
                        let _ = sender.send(result);
                    }
                    None => warn!(env = %link.env_id, "unexpected handshake reply after startup"),
                }
            }
            Some(id) => {
                let outcome = match reply.outcome {
                    WireOutcome::Ok(value) => Ok(value),
                    WireOutcome::Err(failure) => Err(DispatchError::RemoteInvocation(failure)),
                };
                link.resolve(id, outcome);
            }
        }
    }
    debug!(env = %link.env_id, "worker stdout closed");
    link.fail_pending();
}

fn lifecycle_graph() -> Result<StateGraph<LifecycleState, LifecycleAction>, StateMachineError> {
    StateGraph::new(
        vec![
            State::new(LifecycleState::Created),
            State::new(LifecycleState::Running),
            State::new(LifecycleState::Closed),
        ],
        vec![
            Action::new(LifecycleAction::Run),
            Action::new(LifecycleAction::Close),
        ],
        vec![
            Transition::new(
                LifecycleState::Created,
                LifecycleAction::Run,
                LifecycleState::Running,
            ),
            Transition::new(
                LifecycleState::Running,
                LifecycleAction::Close,
                LifecycleState::Closed,
            ),
            // Nothing is running: just change the state.
            Transition::new(
                LifecycleState::Created,
                LifecycleAction::Close,
                LifecycleState::Closed,
            ),
            // Already closed: keep the state.
            Transition::new(
                LifecycleState::Closed,
                LifecycleAction::Close,
                LifecycleState::Closed,
            ),
        ],
    )
}

/// Controller over an environment living in its own OS process.
pub struct EnvProcessController {
    env_id: EnvId,
    state: StateGraphIterator<LifecycleState, LifecycleAction>,
    link: Arc<ProcessLink>,
}

impl EnvProcessController {
    /// Launch the worker process, wait for the construction handshake and
    /// enter the CREATED lifecycle state.
    ///
    /// A handshake error (the worker could not build the environment) or an
    /// expired handshake wait fails this constructor with
    /// [`ProcessBoundaryError::ConstructionFailed`]; the child is reaped
    /// and the result-handler thread joined before returning, so no
    /// listener outlives the failure.
    pub fn spawn(config: EnvProcessConfig) -> Result<Self, ProcessBoundaryError> {
        let program = match &config.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };

        info!(
            env = %config.env_id,
            program = %program.display(),
            "launching environment worker"
        );
        let mut child = Command::new(&program)
            .arg("env-worker")
            .arg("--config")
            .arg(&config.config_path)
            .arg("--env-id")
            .arg(&config.env_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => return Err(reap_failed_spawn(child, "worker stdin pipe unavailable")),
        };
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => return Err(reap_failed_spawn(child, "worker stdout pipe unavailable")),
        };

        let link = Arc::new(ProcessLink {
            env_id: config.env_id.clone(),
            pending: Mutex::new(PendingTable {
                next_id: 0,
                entries: HashMap::new(),
            }),
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            reader: Mutex::new(None),
            close_timeout: config.close_timeout,
        });

        let (handshake_sender, mut handshake_receiver) = oneshot::channel();
        let reader_link = Arc::clone(&link);
        let reader = thread::Builder::new()
            .name(format!("env-results-{}", config.env_id))
            .spawn(move || result_handler(reader_link, stdout, handshake_sender));
        match reader {
            Ok(handle) => *link.reader.lock() = Some(handle),
            Err(error) => {
                link.shutdown();
                return Err(ProcessBoundaryError::Spawn(error));
            }
        }

        match recv_with_deadline(&mut handshake_receiver, config.spawn_timeout) {
            DeadlineWait::Ready(Ok(())) => {}
            DeadlineWait::Ready(Err(failure)) => {
                link.shutdown();
                return Err(ProcessBoundaryError::ConstructionFailed(failure));
            }
            DeadlineWait::Closed => {
                link.shutdown();
                return Err(ProcessBoundaryError::ConstructionFailed(RemoteFailure::new(
                    FAILURE_KIND_CONSTRUCTION,
                    "worker exited before completing the construction handshake",
                )));
            }
            DeadlineWait::TimedOut => {
                warn!(env = %config.env_id, "construction handshake timed out");
                link.shutdown();
                return Err(ProcessBoundaryError::ConstructionFailed(RemoteFailure::new(
                    FAILURE_KIND_TIMEOUT,
                    "timed out waiting for the environment worker handshake",
                )));
            }
        }

        let state = lifecycle_graph()
            .and_then(|graph| StateGraphIterator::new(Arc::new(graph), LifecycleState::Created))
            .map_err(|error| {
                link.shutdown();
                ProcessBoundaryError::ConstructionFailed(RemoteFailure::new(
                    FAILURE_KIND_CONSTRUCTION,
                    error.to_string(),
                ))
            })?;

        info!(env = %config.env_id, "environment worker is ready");
        Ok(Self {
            env_id: config.env_id,
            state,
            link,
        })
    }

    pub fn id(&self) -> &str {
        &self.env_id
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> LifecycleState {
        self.state.current()
    }

    /// Drive CREATED→RUNNING and start streaming in the worker.
    pub fn run(&self) -> Result<Promise, StateMachineError> {
        let _guard = self.state.lock();
        self.state.do_action(LifecycleAction::Run)?;
        Ok(self.link.submit(EnvRequest::Start))
    }

    /// Stop streaming; legal only while RUNNING.
    pub fn stop(&self) -> Result<Promise, StateMachineError> {
        let _guard = self.state.lock();
        self.state.assert_state(LifecycleState::Running)?;
        Ok(self.link.submit(EnvRequest::Stop))
    }

    /// Apply a setting change in the worker; legal only while RUNNING.
    pub fn set(&self, action: SetAction) -> Result<Promise, StateMachineError> {
        let _guard = self.state.lock();
        self.state.assert_state(LifecycleState::Running)?;
        Ok(self.link.submit(EnvRequest::Set(action)))
    }

    /// Fetch the capability list; legal only while RUNNING.
    pub fn get_settings(&self) -> Result<Promise, StateMachineError> {
        let _guard = self.state.lock();
        self.state.assert_state(LifecycleState::Running)?;
        Ok(self.link.submit(EnvRequest::GetSettings))
    }

    /// Fetch the stream description; legal only while RUNNING.
    pub fn get_stream_metadata(&self) -> Result<Promise, StateMachineError> {
        let _guard = self.state.lock();
        self.state.assert_state(LifecycleState::Running)?;
        Ok(self.link.submit(EnvRequest::GetStreamMetadata))
    }

    /// Drive the lifecycle to CLOSED and tear the process boundary down.
    ///
    /// From RUNNING this flows a CLOSE task through the queue and awaits the
    /// environment's own close result under the close timeout; expiry is
    /// logged and teardown continues. Always joins the child process first
    /// and the result-handler thread second.
    pub fn close(&self) -> Result<(), StateMachineError> {
        let _guard = self.state.lock();
        let was_running = self.state.is_current(&[LifecycleState::Running]);
        self.state.do_action(LifecycleAction::Close)?;

        if was_running {
            let mut promise = self.link.submit_close();
            if !promise.wait_timeout(self.link.close_timeout) {
                warn!(
                    env = %self.env_id,
                    "timed out awaiting environment close; proceeding with teardown"
                );
            } else if let Some(error) = promise.get_error() {
                warn!(env = %self.env_id, error = %error, "environment close reported an error");
            }
        }

        self.link.shutdown();
        info!(env = %self.env_id, "environment worker closed");
        Ok(())
    }
}

impl Drop for EnvProcessController {
    fn drop(&mut self) {
        // Best-effort: a controller dropped without close() must not leak
        // the child process.
        self.link.shutdown();
    }
}

fn reap_failed_spawn(mut child: Child, message: &str) -> ProcessBoundaryError {
    let _ = child.kill();
    let _ = child.wait();
    ProcessBoundaryError::Spawn(std::io::Error::other(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_bounded() {
        let config = EnvProcessConfig::new("env_0", "/tmp/acqctl.toml");
        assert!(config.program.is_none());
        assert!(config.spawn_timeout > Duration::ZERO);
        assert!(config.close_timeout > Duration::ZERO);
    }

    #[test]
    fn lifecycle_graph_validates() {
        let graph = lifecycle_graph().expect("static graph is valid");
        assert!(graph.has_action(LifecycleState::Created, LifecycleAction::Run));
        assert!(graph.has_action(LifecycleState::Created, LifecycleAction::Close));
        assert!(!graph.has_action(LifecycleState::Closed, LifecycleAction::Run));
    }
}
