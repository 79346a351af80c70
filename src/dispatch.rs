//! Command dispatch: FIFO queue, single worker, promise-style results.
//!
//! # Architecture
//!
//! The dispatcher replaces direct method calls on a shared target with
//! message passing. Commands are sent via an unbounded mpsc channel and each
//! command carries a oneshot resolver for its reply:
//!
//! ```text
//! Caller Thread                        Worker Thread
//! -------------                        -------------
//! 1. Task + Promise created
//! 2. Task sent via mpsc channel ------>
//!                                      3. Receive task (submission order)
//!                                      4. Invoke target method
//!                                      5. Resolve oneshot (result | error)
//! 6. Promise::get_result blocks <------
//! 7. Handle outcome
//! ```
//!
//! Submission never blocks; consumption blocks on the [`Promise`]. A single
//! dedicated worker thread per dispatcher pulls tasks in submission order,
//! which guarantees per-dispatcher command ordering: no two commands against
//! the same target ever run concurrently, so the target does not need to be
//! thread-safe against its own command methods.
//!
//! A failing command is captured and reported through its promise — it never
//! terminates the worker loop. The loop ends on an explicit close sentinel
//! (which runs target cleanup and resolves the sentinel's promise with the
//! cleanup result) or on queue closure, which is treated the same way: a
//! closed channel already provides the sentinel.

use crate::error::DispatchError;
use serde_json::Value;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// What a resolved command carries: exactly one of a return value or an
/// error.
pub type CommandOutcome = Result<Value, DispatchError>;

/// Interval used when polling a promise under a deadline.
const DEADLINE_POLL: Duration = Duration::from_millis(5);

/// Outcome of a bounded receive on a oneshot channel.
pub(crate) enum DeadlineWait<T> {
    Ready(T),
    Closed,
    TimedOut,
}

/// Receive from a oneshot channel with a deadline, without a runtime.
///
/// `tokio`'s oneshot only offers an unbounded blocking receive outside a
/// runtime, so bounded waits poll `try_recv` at a short interval. Bounded
/// waits are rare (process-boundary spawn/close); everything else blocks
/// unboundedly by design.
pub(crate) fn recv_with_deadline<T>(
    receiver: &mut oneshot::Receiver<T>,
    timeout: Duration,
) -> DeadlineWait<T> {
    let deadline = Instant::now() + timeout;
    loop {
        match receiver.try_recv() {
            Ok(value) => return DeadlineWait::Ready(value),
            Err(oneshot::error::TryRecvError::Closed) => return DeadlineWait::Closed,
            Err(oneshot::error::TryRecvError::Empty) => {
                if Instant::now() >= deadline {
                    return DeadlineWait::TimedOut;
                }
                thread::sleep(DEADLINE_POLL);
            }
        }
    }
}

/// A unit of asynchronous work: the request plus the resolver for its
/// single-slot result/error mailbox.
pub struct Task<R> {
    request: R,
    resolver: oneshot::Sender<CommandOutcome>,
}

impl<R> Task<R> {
    /// Create a task and the promise bound to it.
    pub(crate) fn new(request: R) -> (Self, Promise) {
        let (resolver, receiver) = oneshot::channel();
        (Self { request, resolver }, Promise::new(receiver))
    }

    pub(crate) fn into_parts(self) -> (R, oneshot::Sender<CommandOutcome>) {
        (self.request, self.resolver)
    }
}

enum PromiseState {
    Waiting(oneshot::Receiver<CommandOutcome>),
    Settled(Option<CommandOutcome>),
}

/// Caller handle over one dispatched command.
///
/// `wait`/`get_result`/`get_error` block until the worker resolves the task.
/// Draining is destructive: after `get_result` returns a value, a second
/// call observes `None` (consume-once semantics), and likewise for
/// `get_error`. Exactly one of result/error carries a value for a given
/// task. If the worker disappears before resolving, the promise settles with
/// [`DispatchError::WorkerUnavailable`] instead of hanging.
pub struct Promise {
    state: PromiseState,
}

impl Promise {
    pub(crate) fn new(receiver: oneshot::Receiver<CommandOutcome>) -> Self {
        Self {
            state: PromiseState::Waiting(receiver),
        }
    }

    /// A promise that settles immediately with `WorkerUnavailable`.
    pub(crate) fn unavailable() -> Self {
        Self {
            state: PromiseState::Settled(Some(Err(DispatchError::WorkerUnavailable))),
        }
    }

    /// Block until the command is resolved.
    pub fn wait(&mut self) {
        if let PromiseState::Waiting(_) = self.state {
            let PromiseState::Waiting(receiver) =
                std::mem::replace(&mut self.state, PromiseState::Settled(None))
            else {
                return;
            };
            let outcome = receiver
                .blocking_recv()
                .unwrap_or(Err(DispatchError::WorkerUnavailable));
            self.state = PromiseState::Settled(Some(outcome));
        }
    }

    /// Block until resolved or `timeout` expires; returns whether the
    /// promise is settled.
    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        match &mut self.state {
            PromiseState::Settled(_) => true,
            PromiseState::Waiting(receiver) => match recv_with_deadline(receiver, timeout) {
                DeadlineWait::Ready(outcome) => {
                    self.state = PromiseState::Settled(Some(outcome));
                    true
                }
                DeadlineWait::Closed => {
                    self.state =
                        PromiseState::Settled(Some(Err(DispatchError::WorkerUnavailable)));
                    true
                }
                DeadlineWait::TimedOut => false,
            },
        }
    }

    /// Block until resolved, then drain the result slot.
    ///
    /// Returns `None` when the command failed, or when the result was
    /// already drained.
    pub fn get_result(&mut self) -> Option<Value> {
        self.wait();
        let PromiseState::Settled(slot) = &mut self.state else {
            return None;
        };
        if matches!(slot, Some(Ok(_))) {
            match slot.take() {
                Some(Ok(value)) => Some(value),
                _ => None,
            }
        } else {
            None
        }
    }

    /// Block until resolved, then drain the error slot.
    ///
    /// Returns `None` when the command succeeded, or when the error was
    /// already drained.
    pub fn get_error(&mut self) -> Option<DispatchError> {
        self.wait();
        let PromiseState::Settled(slot) = &mut self.state else {
            return None;
        };
        if matches!(slot, Some(Err(_))) {
            match slot.take() {
                Some(Err(error)) => Some(error),
                _ => None,
            }
        } else {
            None
        }
    }
}

/// The object a dispatcher executes commands against.
///
/// `invoke` runs on the dispatcher's worker thread, one command at a time.
/// `on_close` runs when the worker loop terminates (close sentinel or queue
/// closure) and its result resolves the close promise.
pub trait CommandTarget: Send + 'static {
    /// The closed command shape this target accepts.
    type Request: Send + 'static;

    fn invoke(&mut self, request: Self::Request) -> anyhow::Result<Value>;

    fn on_close(&mut self) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }
}

enum WorkItem<R> {
    Invoke(Task<R>),
    Close(oneshot::Sender<CommandOutcome>),
}

/// Owns the FIFO command queue and the single worker thread executing
/// commands against a [`CommandTarget`].
pub struct Dispatcher<R> {
    sender: mpsc::UnboundedSender<WorkItem<R>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl<R: Send + 'static> Dispatcher<R> {
    /// Spawn a dispatcher whose target is constructed *on* the worker
    /// thread.
    ///
    /// `init` builds the target plus an arbitrary ready payload handed back
    /// through the returned receiver. If `init` fails, the error is handed
    /// back instead and the worker exits without serving any command — the
    /// caller observes construction failure by receiving the error (or a
    /// recv error when the thread died).
    pub fn spawn_with<T, P, I>(
        name: &str,
        init: I,
    ) -> std::io::Result<(Self, oneshot::Receiver<anyhow::Result<P>>)>
    where
        T: CommandTarget<Request = R>,
        P: Send + 'static,
        I: FnOnce() -> anyhow::Result<(T, P)> + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel::<WorkItem<R>>();
        let (ready_sender, ready_receiver) = oneshot::channel();
        let worker = thread::Builder::new()
            .name(format!("dispatch-{name}"))
            .spawn(move || {
                let mut target = match init() {
                    Ok((target, payload)) => {
                        if ready_sender.send(Ok(payload)).is_err() {
                            debug!("dispatcher owner went away before construction finished");
                        }
                        target
                    }
                    Err(error) => {
                        let _ = ready_sender.send(Err(error));
                        return;
                    }
                };

                while let Some(item) = receiver.blocking_recv() {
                    match item {
                        WorkItem::Invoke(task) => {
                            let (request, resolver) = task.into_parts();
                            let outcome = target.invoke(request).map_err(|error| {
                                debug!(error = %error, "command failed");
                                DispatchError::from_invocation(&error)
                            });
                            let _ = resolver.send(outcome);
                        }
                        WorkItem::Close(resolver) => {
                            debug!("close sentinel received, stopping worker loop");
                            let outcome = target
                                .on_close()
                                .map_err(|error| DispatchError::from_invocation(&error));
                            let _ = resolver.send(outcome);
                            return;
                        }
                    }
                }

                // Queue closed without an explicit sentinel; channel closure
                // is the sentinel, so run cleanup the same way.
                if let Err(error) = target.on_close() {
                    warn!(error = %error, "target cleanup failed after queue closure");
                }
            })?;

        Ok((
            Self {
                sender,
                worker: Some(worker),
            },
            ready_receiver,
        ))
    }

    /// Spawn a dispatcher over an already-constructed target.
    pub fn spawn<T>(name: &str, target: T) -> std::io::Result<Self>
    where
        T: CommandTarget<Request = R>,
    {
        let (dispatcher, _ready) = Self::spawn_with(name, move || Ok((target, ())))?;
        Ok(dispatcher)
    }

    /// Enqueue a command and return the promise bound to it. Non-blocking.
    ///
    /// If the worker is already gone, the promise settles with
    /// `WorkerUnavailable` instead of hanging.
    pub fn send(&self, request: R) -> Promise {
        let (task, promise) = Task::new(request);
        if self.sender.send(WorkItem::Invoke(task)).is_err() {
            // Dropping the undelivered task drops its resolver, which is
            // what settles the promise.
            debug!("command submitted after worker shutdown");
        }
        promise
    }

    /// Enqueue the close sentinel. The returned promise resolves with the
    /// target's cleanup result once every previously submitted command has
    /// been executed.
    pub fn close(&self) -> Promise {
        let (resolver, receiver) = oneshot::channel();
        if self.sender.send(WorkItem::Close(resolver)).is_err() {
            return Promise::unavailable();
        }
        Promise::new(receiver)
    }

    /// Join the worker thread. Call after `close()` has resolved.
    pub fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("dispatch worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use serde_json::json;

    enum SupplyRequest {
        SetVoltage(f64),
        ReadVoltage,
    }

    #[derive(Default)]
    struct PowerSupply {
        voltage: f64,
        closed: bool,
    }

    impl CommandTarget for PowerSupply {
        type Request = SupplyRequest;

        fn invoke(&mut self, request: SupplyRequest) -> anyhow::Result<Value> {
            match request {
                SupplyRequest::SetVoltage(value) => {
                    if value < 0.0 {
                        bail!("voltage must be non-negative, got {value}");
                    }
                    self.voltage = value;
                    Ok(Value::Null)
                }
                SupplyRequest::ReadVoltage => Ok(json!(self.voltage)),
            }
        }

        fn on_close(&mut self) -> anyhow::Result<Value> {
            self.closed = true;
            Ok(json!("closed"))
        }
    }

    #[test]
    fn successful_command_resolves_result_once() {
        let dispatcher = Dispatcher::spawn("supply", PowerSupply::default()).expect("spawn");
        let mut promise = dispatcher.send(SupplyRequest::SetVoltage(12.0));
        assert_eq!(promise.get_result(), Some(Value::Null));
        // Drained: second read observes the empty slot.
        assert_eq!(promise.get_result(), None);
        assert_eq!(promise.get_error(), None);

        let mut read = dispatcher.send(SupplyRequest::ReadVoltage);
        assert_eq!(read.get_result(), Some(json!(12.0)));
    }

    #[test]
    fn failing_command_resolves_error_and_keeps_worker_alive() {
        let dispatcher = Dispatcher::spawn("supply", PowerSupply::default()).expect("spawn");
        let mut failed = dispatcher.send(SupplyRequest::SetVoltage(-5.0));
        assert_eq!(failed.get_result(), None);
        let error = failed.get_error().expect("error expected");
        match error {
            DispatchError::RemoteInvocation(failure) => {
                assert!(failure.message.contains("voltage must be non-negative"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // Consume-once applies to the error slot too.
        assert_eq!(failed.get_error(), None);

        // The worker survived the failure and keeps serving commands.
        let mut read = dispatcher.send(SupplyRequest::ReadVoltage);
        assert_eq!(read.get_result(), Some(json!(0.0)));
    }

    #[test]
    fn close_runs_cleanup_and_stops_the_worker() {
        let mut dispatcher = Dispatcher::spawn("supply", PowerSupply::default()).expect("spawn");
        let mut close = dispatcher.close();
        assert_eq!(close.get_result(), Some(json!("closed")));
        dispatcher.join();

        let mut late = dispatcher.send(SupplyRequest::ReadVoltage);
        assert_eq!(late.get_error(), Some(DispatchError::WorkerUnavailable));
    }

    #[test]
    fn construction_failure_reaches_the_caller() {
        let (_dispatcher, mut ready) = Dispatcher::<SupplyRequest>::spawn_with(
            "broken",
            || -> anyhow::Result<(PowerSupply, ())> { bail!("no such device") },
        )
        .expect("thread spawn");
        let result = ready.blocking_recv().expect("worker reported");
        assert!(result.is_err());
    }

    #[test]
    fn wait_timeout_reports_pending_and_settled() {
        let dispatcher = Dispatcher::spawn("supply", PowerSupply::default()).expect("spawn");
        let mut promise = dispatcher.send(SupplyRequest::ReadVoltage);
        assert!(promise.wait_timeout(Duration::from_secs(1)));
        assert_eq!(promise.get_result(), Some(json!(0.0)));
    }
}
