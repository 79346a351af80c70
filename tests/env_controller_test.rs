//! Integration tests for the same-process environment controller: promise
//! round trips, capability validation and the live stream feeding a capture
//! session.

use acqctl::capture::CaptureSession;
use acqctl::env::controller::EnvController;
use acqctl::env::mock::{MockEnvironment, MockEnvironmentConfig};
use acqctl::env::{Environment, SetAction};
use acqctl::error::DispatchError;
use anyhow::anyhow;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn mock_controller(frame_rate_hz: f64) -> EnvController {
    EnvController::new("mock", move || {
        let config = MockEnvironmentConfig {
            frame_rate_hz,
            channels: 1,
            samples_per_channel: 16,
        };
        Ok(Box::new(MockEnvironment::new("mock", config)?) as Box<dyn Environment>)
    })
    .expect("controller construction")
}

/// A failed environment construction fails the controller constructor; the
/// controller surface never appears.
#[test]
fn construction_failure_propagates() {
    let result = EnvController::new("dead", || Err(anyhow!("no transducer connected")));
    let error = result.err().expect("constructor must fail");
    assert!(format!("{error:#}").contains("no transducer connected"));
}

/// Valid and invalid `set` commands resolve through promises; the invalid
/// one wraps the environment's own rejection.
#[test]
fn set_round_trips_and_rejections() {
    let controller = mock_controller(200.0);

    let mut ok = controller.set(SetAction::new("gain", json!(24.0)));
    assert_eq!(ok.get_result(), Some(json!(24.0)));

    // In range for the capability list, rejected by the device model.
    let mut rejected = controller.set(SetAction::new("voltage", json!(-5.0)));
    match rejected.get_error().expect("rejection expected") {
        DispatchError::RemoteInvocation(failure) => {
            assert!(failure.message.contains("out of range"));
        }
        other => panic!("expected RemoteInvocation, got {other:?}"),
    }

    // Not on the capability list at all: rejected before invocation.
    let mut unknown = controller.set(SetAction::new("warp_factor", json!(9.0)));
    match unknown.get_error().expect("unknown setting") {
        DispatchError::RemoteInvocation(failure) => {
            assert!(failure.message.contains("no setting named"));
        }
        other => panic!("expected RemoteInvocation, got {other:?}"),
    }

    let mut close = controller.close();
    close.wait();
}

/// The stream callback feeds a capture session while commands keep flowing:
/// start, capture a full buffer, observe readiness, stop.
#[test]
fn stream_feeds_capture_while_commands_flow() {
    let controller = mock_controller(500.0);

    let (session, mut progress) = CaptureSession::new("mock", 5).expect("session");
    let session = Arc::new(session);
    session.attach(&controller.stream());

    let mut metadata = controller.get_stream_metadata();
    let metadata_value = metadata.get_result().expect("metadata");
    session.set_stream_metadata(serde_json::from_value(metadata_value).expect("valid metadata"));

    assert_eq!(controller.start().get_error(), None);
    session.start_capture().expect("capture");

    // Commands interleave with the running stream.
    let mut gain = controller.set(SetAction::new("gain", json!(12.0)));
    assert_eq!(gain.get_result(), Some(json!(12.0)));

    let done = loop {
        let event = progress
            .blocking_recv()
            .expect("progress channel stays open");
        if event.done {
            break event;
        }
    };
    assert_eq!(done.captured, 5);
    session.finish_capture().expect("capture done");

    assert_eq!(controller.stop().get_error(), None);

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("live_capture.json");
    let written = session.save(&path).expect("save");
    assert_eq!(written, 5);

    let mut close = controller.close();
    close.wait();
}

/// Closing flows the sentinel through the queue: queued commands execute
/// first, then the environment closes and the worker stops.
#[test]
fn close_resolves_after_queued_commands() {
    let mut controller = mock_controller(200.0);

    let mut queued = controller.get_settings();
    let mut close = controller.close();

    assert!(queued.get_result().is_some());
    close.wait();
    controller.join();

    let mut late = controller.get_settings();
    assert!(
        late.wait_timeout(Duration::from_secs(1)),
        "late promise must settle"
    );
    assert_eq!(late.get_error(), Some(DispatchError::WorkerUnavailable));
}
