//! Mock environment for testing and headless demos.
//!
//! Replays synthetic frames on its own acquisition thread at a configurable
//! frame rate, without physical hardware. Exposes two validated settings
//! (`gain` in dB, `voltage` in V) so the command-error paths can be
//! exercised: an out-of-range `set` fails the way a real driver would.

use crate::env::{
    Environment, Frame, FrameArray, OutputMetadata, SetAction, SettingDescriptor, StreamHub,
    StreamMetadata,
};
use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Gain range of the simulated front end, in dB.
const GAIN_RANGE_DB: (f64, f64) = (0.0, 54.0);
/// Transmit voltage range of the simulated front end, in V.
const VOLTAGE_RANGE_V: (f64, f64) = (5.0, 90.0);

/// Tuning knobs of the mock environment.
#[derive(Debug, Clone)]
pub struct MockEnvironmentConfig {
    /// Frames published per second.
    pub frame_rate_hz: f64,
    /// Number of array outputs per frame.
    pub channels: usize,
    /// Samples per output array.
    pub samples_per_channel: usize,
}

impl Default for MockEnvironmentConfig {
    fn default() -> Self {
        Self {
            frame_rate_hz: 20.0,
            channels: 2,
            samples_per_channel: 64,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FrontEndState {
    gain_db: f64,
    voltage_v: f64,
}

/// Simulated acquisition environment.
pub struct MockEnvironment {
    id: String,
    config: MockEnvironmentConfig,
    stream: Arc<StreamHub>,
    front_end: Arc<Mutex<FrontEndState>>,
    running: Arc<AtomicBool>,
    acquisition: Option<thread::JoinHandle<()>>,
}

impl MockEnvironment {
    pub fn new(id: impl Into<String>, config: MockEnvironmentConfig) -> Result<Self> {
        if config.frame_rate_hz <= 0.0 {
            bail!("frame rate must be positive, got {}", config.frame_rate_hz);
        }
        if config.channels == 0 || config.samples_per_channel == 0 {
            bail!("mock environment needs at least one channel and one sample");
        }
        Ok(Self {
            id: id.into(),
            config,
            stream: Arc::new(StreamHub::new()),
            front_end: Arc::new(Mutex::new(FrontEndState {
                gain_db: 30.0,
                voltage_v: 10.0,
            })),
            running: Arc::new(AtomicBool::new(false)),
            acquisition: None,
        })
    }
}

impl Environment for MockEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            bail!("environment '{}' is already running", self.id);
        }

        let stream = Arc::clone(&self.stream);
        let front_end = Arc::clone(&self.front_end);
        let running = Arc::clone(&self.running);
        let config = self.config.clone();
        let period = Duration::from_secs_f64(1.0 / config.frame_rate_hz);

        let handle = thread::Builder::new()
            .name(format!("mock-acq-{}", self.id))
            .spawn(move || {
                let mut rng = rand::thread_rng();
                let mut seq: u64 = 0;
                while running.load(Ordering::SeqCst) {
                    let state = *front_end.lock();
                    let amplitude = state.voltage_v / VOLTAGE_RANGE_V.1;
                    // Non-empty range even at zero gain.
                    let noise = state.gain_db / GAIN_RANGE_DB.1 * 0.1 + 1e-9;
                    let outputs = (0..config.channels)
                        .map(|channel| {
                            let data = (0..config.samples_per_channel)
                                .map(|sample| {
                                    let phase = (seq as usize * config.samples_per_channel
                                        + sample)
                                        as f64
                                        * 0.05
                                        + channel as f64;
                                    amplitude * phase.sin() + rng.gen_range(-noise..=noise)
                                })
                                .collect();
                            FrameArray {
                                shape: vec![config.samples_per_channel],
                                data,
                            }
                        })
                        .collect();
                    stream.publish(&Frame { seq, outputs });
                    seq += 1;
                    thread::sleep(period);
                }
                debug!("mock acquisition loop finished after {seq} frames");
            });
        let handle = match handle {
            Ok(handle) => handle,
            Err(error) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(error).context("failed to spawn mock acquisition thread");
            }
        };
        self.acquisition = Some(handle);
        info!(id = %self.id, "mock environment started");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.acquisition.take() {
            if handle.join().is_err() {
                bail!("mock acquisition thread panicked");
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stop()?;
        info!(id = %self.id, "mock environment closed");
        Ok(())
    }

    fn set(&mut self, action: &SetAction) -> Result<Value> {
        let value = action
            .value
            .as_f64()
            .with_context(|| format!("setting '{}' expects a number", action.name))?;
        let (min, max) = match action.name.as_str() {
            "gain" => GAIN_RANGE_DB,
            "voltage" => VOLTAGE_RANGE_V,
            other => bail!("environment '{}' has no setting named '{other}'", self.id),
        };
        if value < min || value > max {
            bail!(
                "setting '{}' out of range: {value} not in [{min}, {max}]",
                action.name
            );
        }
        let mut state = self.front_end.lock();
        match action.name.as_str() {
            "gain" => state.gain_db = value,
            _ => state.voltage_v = value,
        }
        Ok(action.value.clone())
    }

    fn get_settings(&self) -> Result<Vec<SettingDescriptor>> {
        Ok(vec![
            SettingDescriptor {
                name: "gain".to_string(),
                unit: Some("dB".to_string()),
                min: Some(GAIN_RANGE_DB.0),
                max: Some(GAIN_RANGE_DB.1),
            },
            SettingDescriptor {
                name: "voltage".to_string(),
                unit: Some("V".to_string()),
                min: Some(VOLTAGE_RANGE_V.0),
                max: Some(VOLTAGE_RANGE_V.1),
            },
        ])
    }

    fn stream(&self) -> Arc<StreamHub> {
        Arc::clone(&self.stream)
    }

    fn get_stream_metadata(&self) -> Result<StreamMetadata> {
        Ok(StreamMetadata {
            outputs: (0..self.config.channels)
                .map(|_| OutputMetadata {
                    shape: vec![self.config.samples_per_channel],
                    dtype: "f64".to_string(),
                    unit: None,
                })
                .collect(),
            sampling_frequency_hz: Some(self.config.frame_rate_hz),
        })
    }
}

impl Drop for MockEnvironment {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.acquisition.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn rejects_out_of_range_voltage() {
        let mut env =
            MockEnvironment::new("mock", MockEnvironmentConfig::default()).expect("construct");
        let error = env
            .set(&SetAction::new("voltage", json!(-5.0)))
            .expect_err("negative voltage must fail");
        assert!(error.to_string().contains("out of range"));
    }

    #[test]
    fn applies_valid_setting() {
        let mut env =
            MockEnvironment::new("mock", MockEnvironmentConfig::default()).expect("construct");
        let applied = env
            .set(&SetAction::new("gain", json!(40.0)))
            .expect("gain in range");
        assert_eq!(applied, json!(40.0));
    }

    #[test]
    fn unknown_setting_is_rejected() {
        let mut env =
            MockEnvironment::new("mock", MockEnvironmentConfig::default()).expect("construct");
        let error = env
            .set(&SetAction::new("focus", json!(1.0)))
            .expect_err("unknown setting");
        assert!(error.to_string().contains("no setting named"));
    }

    #[test]
    fn streams_frames_while_running() {
        let config = MockEnvironmentConfig {
            frame_rate_hz: 200.0,
            channels: 1,
            samples_per_channel: 8,
        };
        let mut env = MockEnvironment::new("mock", config).expect("construct");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        env.stream().subscribe(Arc::new(move |frame| {
            assert_eq!(frame.outputs.len(), 1);
            assert_eq!(frame.outputs[0].data.len(), 8);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        env.start().expect("start");
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        env.stop().expect("stop");
        assert!(seen.load(Ordering::SeqCst) >= 3, "expected at least 3 frames");

        let error = env.start().err();
        assert!(error.is_none(), "restart after stop must work");
        env.close().expect("close");
    }
}
