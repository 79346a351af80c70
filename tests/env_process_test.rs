//! Integration tests for the process-boundary controller. These spawn the
//! real `acqctl` binary in `env-worker` mode, so they run serialized.

use acqctl::env::process::{EnvProcessConfig, EnvProcessController, LifecycleState};
use acqctl::env::SetAction;
use acqctl::error::{DispatchError, ProcessBoundaryError, StateMachineError};
use serde_json::json;
use serial_test::serial;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn worker_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_acqctl"))
}

fn write_config(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("env.toml");
    let mut file = std::fs::File::create(&path).expect("create config");
    file.write_all(contents.as_bytes()).expect("write config");
    path
}

fn valid_config(dir: &Path) -> PathBuf {
    write_config(
        dir,
        r#"
        [application]
        name = "acqctl process test"

        [capture]
        capacity = 4

        [environment]
        kind = "mock"
        frame_rate_hz = 100.0
        channels = 1
        samples_per_channel = 8
        "#,
    )
}

fn spawn_config(config_path: PathBuf) -> EnvProcessConfig {
    let mut config = EnvProcessConfig::new("env_0", config_path);
    config.program = Some(worker_binary());
    config.spawn_timeout = Duration::from_secs(30);
    config.close_timeout = Duration::from_secs(10);
    config
}

/// A worker that cannot construct its environment posts a null-id error and
/// the controller constructor fails — distinct from a command failure.
#[test]
#[serial]
fn construction_failure_fails_the_constructor() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = write_config(
        dir.path(),
        r#"
        [application]
        name = "acqctl process test"

        [capture]
        capacity = 0

        [environment]
        kind = "mock"
        "#,
    );

    let result = EnvProcessController::spawn(spawn_config(config_path));
    match result {
        Err(ProcessBoundaryError::ConstructionFailed(failure)) => {
            assert!(
                failure.message.contains("configuration")
                    || failure.message.contains("capacity"),
                "unexpected failure: {failure}"
            );
        }
        Ok(_) => panic!("constructor must fail"),
        Err(other) => panic!("expected ConstructionFailed, got {other}"),
    }
}

/// A missing configuration file is also a construction failure.
#[test]
#[serial]
fn missing_config_is_a_construction_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("does_not_exist.toml");

    let result = EnvProcessController::spawn(spawn_config(config_path));
    assert!(matches!(
        result,
        Err(ProcessBoundaryError::ConstructionFailed(_))
    ));
}

/// Full lifecycle against the real worker: run, pipelined commands resolved
/// by id, remote rejection, close.
#[test]
#[serial]
fn commands_round_trip_across_the_boundary() {
    let dir = tempfile::tempdir().expect("tempdir");
    let controller =
        EnvProcessController::spawn(spawn_config(valid_config(dir.path()))).expect("spawn");
    assert_eq!(controller.lifecycle(), LifecycleState::Created);

    // Commands before run() are a typed wrong-state error.
    match controller.get_settings() {
        Err(StateMachineError::WrongState { .. }) => {}
        Err(other) => panic!("expected WrongState, got {other:?}"),
        Ok(_) => panic!("expected WrongState, got a promise"),
    }

    let mut started = controller.run().expect("run from CREATED");
    assert_eq!(started.get_error(), None);
    assert_eq!(controller.lifecycle(), LifecycleState::Running);

    // Pipelined submissions: every promise is resolved by its task id.
    let mut settings = controller.get_settings().expect("running");
    let mut metadata = controller.get_stream_metadata().expect("running");
    let mut gain = controller
        .set(SetAction::new("gain", json!(42.0)))
        .expect("running");

    let settings_value = settings.get_result().expect("settings value");
    let names: Vec<&str> = settings_value
        .as_array()
        .expect("list")
        .iter()
        .filter_map(|entry| entry["name"].as_str())
        .collect();
    assert_eq!(names, vec!["gain", "voltage"]);

    assert!(metadata.get_result().is_some());
    assert_eq!(gain.get_result(), Some(json!(42.0)));

    // A remote rejection arrives as a reconstructed invocation failure.
    let mut rejected = controller
        .set(SetAction::new("voltage", json!(-5.0)))
        .expect("running");
    match rejected.get_error().expect("rejection expected") {
        DispatchError::RemoteInvocation(failure) => {
            assert!(failure.message.contains("out of range"));
        }
        other => panic!("expected RemoteInvocation, got {other:?}"),
    }

    controller.close().expect("close from RUNNING");
    assert_eq!(controller.lifecycle(), LifecycleState::Closed);

    // Closing an already closed controller keeps the state.
    controller.close().expect("close is idempotent");
    assert_eq!(controller.lifecycle(), LifecycleState::Closed);

    // Commands after close are wrong-state errors again.
    assert!(matches!(
        controller.stop(),
        Err(StateMachineError::WrongState { .. })
    ));
}

/// Closing from CREATED never sends a CLOSE command; dropping the pipe is
/// the sentinel and the worker still exits cleanly.
#[test]
#[serial]
fn close_from_created_is_a_noop_shortcut() {
    let dir = tempfile::tempdir().expect("tempdir");
    let controller =
        EnvProcessController::spawn(spawn_config(valid_config(dir.path()))).expect("spawn");
    assert_eq!(controller.lifecycle(), LifecycleState::Created);

    controller.close().expect("close from CREATED");
    assert_eq!(controller.lifecycle(), LifecycleState::Closed);

    // The lifecycle graph rejects a run after close.
    assert!(matches!(
        controller.run(),
        Err(StateMachineError::ActionNotAvailable { .. })
    ));
}
