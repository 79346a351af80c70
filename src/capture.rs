//! Bounded capture of a finite run of streamed frames.
//!
//! [`CaptureBuffer`] is the fixed-capacity, append-only store;
//! [`CaptureSession`] owns it together with the small state graph that makes
//! capturing safe to drive from a UI:
//!
//! ```text
//! EMPTY --capture--> CAPTURING --capture_done--> CAPTURED --save--> EMPTY
//! CAPTURING --capture--> CAPTURING   (restart, discarding partial data)
//! CAPTURED  --capture--> CAPTURING   (start fresh, discarding the capture)
//! ```
//!
//! The session's `on_frame` callback is registered on the same
//! [`StreamHub`](crate::env::StreamHub) that feeds the live display and runs
//! on the producer's acquisition thread, so it only does O(1) bookkeeping
//! inside a short, I/O-free critical section. The buffer never
//! self-transitions: readiness is announced on the progress channel and the
//! owner explicitly drives `capture_done`. `save` snapshots the frames under
//! the lock and writes the file outside it, so a slow disk never stalls the
//! producer.

use crate::env::{EnvId, Frame, StreamHub, StreamMetadata};
use crate::error::{BufferError, StateMachineError};
use crate::state_graph::{
    Action, State, StateGraph, StateGraphIterator, Transition, TransitionOutcome,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Capture lifecycle states.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CaptureState {
    Empty,
    Capturing,
    Captured,
}

/// Capture lifecycle actions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CaptureAction {
    Capture,
    CaptureDone,
    Save,
}

/// Fixed-capacity append-only frame store.
///
/// Invariant: `0 <= len() <= capacity()`; `is_ready()` ⇔ `len() ==
/// capacity()`.
pub struct CaptureBuffer {
    capacity: usize,
    frames: Vec<Frame>,
}

impl CaptureBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            frames: Vec::with_capacity(capacity),
        }
    }

    /// Store one frame. Fails with [`BufferError::BufferFull`] once the
    /// buffer reached capacity — the producer-side guard for a feeding
    /// callback that did not stop after readiness was announced.
    pub fn append(&mut self, frame: Frame) -> Result<(), BufferError> {
        if self.is_ready() {
            return Err(BufferError::BufferFull);
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.frames.len() == self.capacity
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Discard all stored frames, keeping the capacity.
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// Descriptor persisted alongside the captured frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureMetadata {
    /// Environment the frames were captured from.
    pub environment: EnvId,
    /// Version of the software that wrote the file.
    pub software_version: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stream: Option<StreamMetadata>,
    /// Free-form annotations.
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

/// The persisted container: metadata descriptor plus the ordered frames.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct CaptureRecord {
    pub metadata: CaptureMetadata,
    pub frames: Vec<Frame>,
}

/// Persist a capture record as pretty-printed JSON.
pub fn save_capture(record: &CaptureRecord, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(record)?;
    fs::write(path, json).with_context(|| format!("failed to write capture to {path:?}"))?;
    Ok(())
}

/// Load a capture record back; the round trip is lossless.
pub fn load_capture(path: &Path) -> Result<CaptureRecord> {
    let json =
        fs::read_to_string(path).with_context(|| format!("failed to read capture from {path:?}"))?;
    let record = serde_json::from_str(&json)?;
    Ok(record)
}

/// Progress announcement emitted after every append.
///
/// `done` is set once the buffer reached capacity; the observer reacts by
/// driving `capture_done` on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureProgress {
    pub captured: usize,
    pub done: bool,
}

/// Owner of one capture buffer and its lifecycle graph.
pub struct CaptureSession {
    env_id: EnvId,
    buffer: Arc<Mutex<CaptureBuffer>>,
    stream_metadata: Mutex<Option<StreamMetadata>>,
    state: StateGraphIterator<CaptureState, CaptureAction>,
    /// Mirrors "current state == CAPTURING" for the producer path, so
    /// `on_frame` never touches the state-graph lock (which a slow caller
    /// like `save` may hold).
    active: Arc<AtomicBool>,
    progress: mpsc::UnboundedSender<CaptureProgress>,
}

impl CaptureSession {
    /// Create a session with a fresh buffer of `capacity` frames, returning
    /// the receiver for its progress announcements.
    pub fn new(
        env_id: impl Into<EnvId>,
        capacity: usize,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CaptureProgress>), StateMachineError> {
        let buffer = Arc::new(Mutex::new(CaptureBuffer::new(capacity)));
        let active = Arc::new(AtomicBool::new(false));
        let (progress_sender, progress_receiver) = mpsc::unbounded_channel();

        // Every entry into CAPTURING starts a fresh run; partial or previous
        // data is discarded by the transition itself.
        let restart = {
            let buffer = Arc::clone(&buffer);
            let active = Arc::clone(&active);
            move |_event: &mut crate::state_graph::Event<CaptureState, CaptureAction>| {
                buffer.lock().clear();
                active.store(true, Ordering::Release);
            }
        };
        let deactivate = {
            let active = Arc::clone(&active);
            move |_event: &mut crate::state_graph::Event<CaptureState, CaptureAction>| {
                active.store(false, Ordering::Release);
            }
        };
        let clear_after_save = {
            let buffer = Arc::clone(&buffer);
            move |_event: &mut crate::state_graph::Event<CaptureState, CaptureAction>| {
                buffer.lock().clear();
            }
        };

        let graph = StateGraph::new(
            vec![
                State::new(CaptureState::Empty),
                State::new(CaptureState::Capturing)
                    .on_enter(restart)
                    .on_exit(deactivate),
                State::new(CaptureState::Captured),
            ],
            vec![
                Action::new(CaptureAction::Capture),
                Action::new(CaptureAction::CaptureDone),
                Action::new(CaptureAction::Save),
            ],
            vec![
                Transition::new(CaptureState::Empty, CaptureAction::Capture, CaptureState::Capturing),
                Transition::new(
                    CaptureState::Capturing,
                    CaptureAction::Capture,
                    CaptureState::Capturing,
                ),
                Transition::new(
                    CaptureState::Capturing,
                    CaptureAction::CaptureDone,
                    CaptureState::Captured,
                ),
                Transition::new(
                    CaptureState::Captured,
                    CaptureAction::Capture,
                    CaptureState::Capturing,
                ),
                Transition::new(CaptureState::Captured, CaptureAction::Save, CaptureState::Empty)
                    .on_enter(clear_after_save),
            ],
        )?;
        let state = StateGraphIterator::new(Arc::new(graph), CaptureState::Empty)?;

        Ok((
            Self {
                env_id: env_id.into(),
                buffer,
                stream_metadata: Mutex::new(None),
                state,
                active,
                progress: progress_sender,
            },
            progress_receiver,
        ))
    }

    /// Record the stream description that will be persisted with captures.
    pub fn set_stream_metadata(&self, metadata: StreamMetadata) {
        *self.stream_metadata.lock() = Some(metadata);
    }

    /// Register this session on a stream hub, next to the live display.
    pub fn attach(self: &Arc<Self>, hub: &StreamHub) {
        let session = Arc::clone(self);
        hub.subscribe(Arc::new(move |frame| session.on_frame(frame)));
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CaptureState {
        self.state.current()
    }

    pub fn captured(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_ready(&self) -> bool {
        self.buffer.lock().is_ready()
    }

    /// Drive `capture`: from EMPTY or CAPTURED start a fresh run, from
    /// CAPTURING restart and discard the partial data.
    pub fn start_capture(&self) -> Result<TransitionOutcome, StateMachineError> {
        self.state.do_action(CaptureAction::Capture)
    }

    /// Drive `capture_done` after readiness was observed (or to stop a run
    /// early, keeping what was captured so far).
    pub fn finish_capture(&self) -> Result<TransitionOutcome, StateMachineError> {
        self.state.do_action(CaptureAction::CaptureDone)
    }

    /// Streaming callback: runs on the producer's acquisition thread.
    ///
    /// Only bookkeeping happens here — append under a short lock and a
    /// progress announcement. The session never drives `capture_done`
    /// itself; the observer does, once `done` is announced.
    pub fn on_frame(&self, frame: &Frame) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let (captured, done) = {
            let mut buffer = self.buffer.lock();
            if buffer.is_ready() {
                // Readiness was already announced; the producer guard keeps
                // late frames out.
                (buffer.len(), true)
            } else {
                match buffer.append(frame.clone()) {
                    Ok(()) => (buffer.len(), buffer.is_ready()),
                    Err(_) => (buffer.len(), true),
                }
            }
        };
        let _ = self.progress.send(CaptureProgress { captured, done });
    }

    /// Persist the captured frames plus metadata, then drive `save` back to
    /// EMPTY.
    ///
    /// Fails with [`BufferError::EmptyBuffer`] when nothing was captured
    /// and with `WrongState` when no finished capture exists. Returns the
    /// number of frames written.
    pub fn save(&self, path: &Path) -> Result<usize> {
        let _guard = self.state.lock();
        self.state.assert_state(CaptureState::Captured)?;

        let frames = {
            let buffer = self.buffer.lock();
            if buffer.is_empty() {
                return Err(BufferError::EmptyBuffer.into());
            }
            buffer.frames().to_vec()
        };
        let count = frames.len();

        let record = CaptureRecord {
            metadata: CaptureMetadata {
                environment: self.env_id.clone(),
                software_version: env!("CARGO_PKG_VERSION").to_string(),
                created_at: Utc::now(),
                stream: self.stream_metadata.lock().clone(),
                parameters: HashMap::new(),
            },
            frames,
        };
        save_capture(&record, path)?;
        debug!(count, path = %path.display(), "capture written");

        self.state.do_action(CaptureAction::Save)?;
        info!(env = %self.env_id, count, "capture saved");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::FrameArray;
    use tempfile::tempdir;

    fn frame(seq: u64) -> Frame {
        Frame {
            seq,
            outputs: vec![FrameArray {
                shape: vec![2],
                data: vec![seq as f64, seq as f64 + 0.5],
            }],
        }
    }

    #[test]
    fn buffer_tracks_readiness_and_rejects_overflow() {
        let mut buffer = CaptureBuffer::new(3);
        assert_eq!(buffer.len(), 0);
        assert!(!buffer.is_ready());

        for seq in 0..3 {
            buffer.append(frame(seq)).expect("capacity not reached");
        }
        assert!(buffer.is_ready());
        assert_eq!(buffer.append(frame(3)), Err(BufferError::BufferFull));
        assert_eq!(buffer.len(), 3);

        let fresh = CaptureBuffer::new(3);
        assert_eq!(fresh.len(), 0);
    }

    #[test]
    fn session_walks_the_capture_graph() {
        let (session, mut progress) = CaptureSession::new("env_0", 3).expect("session");
        assert_eq!(session.state(), CaptureState::Empty);

        session.start_capture().expect("capture from empty");
        assert_eq!(session.state(), CaptureState::Capturing);

        for seq in 0..3 {
            session.on_frame(&frame(seq));
        }
        assert!(session.is_ready());
        let last = {
            let mut latest = None;
            while let Ok(event) = progress.try_recv() {
                latest = Some(event);
            }
            latest.expect("progress events emitted")
        };
        assert_eq!(
            last,
            CaptureProgress {
                captured: 3,
                done: true
            }
        );

        session.finish_capture().expect("capture done");
        assert_eq!(session.state(), CaptureState::Captured);
    }

    #[test]
    fn frames_are_ignored_outside_capturing() {
        let (session, _progress) = CaptureSession::new("env_0", 2).expect("session");
        session.on_frame(&frame(0));
        assert_eq!(session.captured(), 0);
    }

    #[test]
    fn restart_discards_partial_data() {
        let (session, _progress) = CaptureSession::new("env_0", 3).expect("session");
        session.start_capture().expect("capture");
        session.on_frame(&frame(0));
        session.on_frame(&frame(1));
        assert_eq!(session.captured(), 2);

        session.start_capture().expect("restart while capturing");
        assert_eq!(session.state(), CaptureState::Capturing);
        assert_eq!(session.captured(), 0);
    }

    #[test]
    fn save_requires_a_finished_capture() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("capture.json");
        let (session, _progress) = CaptureSession::new("env_0", 2).expect("session");

        let error = session.save(&path).expect_err("nothing captured yet");
        assert!(error.downcast_ref::<StateMachineError>().is_some());
    }

    #[test]
    fn save_rejects_an_empty_buffer() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("capture.json");
        let (session, _progress) = CaptureSession::new("env_0", 2).expect("session");
        session.start_capture().expect("capture");
        session.finish_capture().expect("stopped before any frame");

        let error = session.save(&path).expect_err("empty buffer");
        assert_eq!(
            error.downcast_ref::<BufferError>(),
            Some(&BufferError::EmptyBuffer)
        );
    }

    #[test]
    fn save_persists_count_frames_and_returns_to_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("capture.json");
        let (session, _progress) = CaptureSession::new("env_0", 3).expect("session");
        session.start_capture().expect("capture");
        // Stopped early: two of three frames.
        session.on_frame(&frame(0));
        session.on_frame(&frame(1));
        session.finish_capture().expect("early stop");

        let written = session.save(&path).expect("save");
        assert_eq!(written, 2);
        assert_eq!(session.state(), CaptureState::Empty);
        assert_eq!(session.captured(), 0);

        let record = load_capture(&path).expect("load back");
        assert_eq!(record.frames.len(), 2);
        assert_eq!(record.frames[0], frame(0));
        assert_eq!(record.metadata.environment, "env_0");
    }

    #[test]
    fn capture_record_round_trips() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("roundtrip.json");
        let record = CaptureRecord {
            metadata: CaptureMetadata {
                environment: "env_0".to_string(),
                software_version: "0.1.0".to_string(),
                created_at: Utc::now(),
                stream: None,
                parameters: HashMap::new(),
            },
            frames: vec![frame(0), frame(1)],
        };
        save_capture(&record, &path).expect("save");
        let back = load_capture(&path).expect("load");
        assert_eq!(record, back);
    }
}
