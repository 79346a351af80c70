//! Configuration management.
//!
//! Settings are loaded from TOML files through the `config` crate and then
//! validated semantically — parsing errors and "parses but makes no sense"
//! errors are reported as separate [`ConfigError`] variants. The core only
//! consumes the capture capacity and the environment descriptor; everything
//! else (log level, process timeouts) belongs to the ambient stack.

use crate::env::mock::{MockEnvironment, MockEnvironmentConfig};
use crate::env::Environment;
use crate::error::ConfigError;
use anyhow::Result;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub capture: CaptureSettings,
    pub environment: EnvironmentSettings,
    #[serde(default)]
    pub process: ProcessSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplicationSettings {
    pub name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureSettings {
    /// Number of frames one capture run records.
    pub capacity: usize,
}

/// Descriptor of the environment to construct.
#[derive(Debug, Deserialize, Clone)]
pub struct EnvironmentSettings {
    /// Environment kind; currently `"mock"`.
    pub kind: String,
    #[serde(default = "default_frame_rate")]
    pub frame_rate_hz: f64,
    #[serde(default = "default_channels")]
    pub channels: usize,
    #[serde(default = "default_samples")]
    pub samples_per_channel: usize,
}

/// Bounded waits of the process-boundary controller.
#[derive(Debug, Deserialize, Clone)]
pub struct ProcessSettings {
    #[serde(with = "humantime_serde", default = "default_spawn_timeout")]
    pub spawn_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_close_timeout")]
    pub close_timeout: Duration,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            spawn_timeout: default_spawn_timeout(),
            close_timeout: default_close_timeout(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_frame_rate() -> f64 {
    20.0
}

fn default_channels() -> usize {
    2
}

fn default_samples() -> usize {
    64
}

fn default_spawn_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_close_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Settings {
    /// Load and validate settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        let settings: Self = raw.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation of values that parse fine but are logically
    /// wrong.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application.name.is_empty() {
            return Err(ConfigError::Invalid(
                "application name cannot be empty".to_string(),
            ));
        }
        if !matches!(
            self.application.log_level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::Invalid(format!(
                "invalid log level '{}'",
                self.application.log_level
            )));
        }
        if self.capture.capacity == 0 {
            return Err(ConfigError::Invalid(
                "capture capacity must be greater than 0".to_string(),
            ));
        }
        if self.environment.frame_rate_hz <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "frame rate must be positive, got {}",
                self.environment.frame_rate_hz
            )));
        }
        if self.environment.kind != "mock" {
            return Err(ConfigError::Invalid(format!(
                "unknown environment kind '{}'",
                self.environment.kind
            )));
        }
        Ok(())
    }
}

impl EnvironmentSettings {
    /// Construct the environment this descriptor names.
    pub fn build(&self, env_id: &str) -> Result<Box<dyn Environment>> {
        match self.kind.as_str() {
            "mock" => Ok(Box::new(MockEnvironment::new(
                env_id,
                MockEnvironmentConfig {
                    frame_rate_hz: self.frame_rate_hz,
                    channels: self.channels,
                    samples_per_channel: self.samples_per_channel,
                },
            )?)),
            other => Err(anyhow::anyhow!("unknown environment kind '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_from_str(toml_str: &str) -> Settings {
        toml::from_str(toml_str).expect("failed to parse test config")
    }

    #[test]
    fn parses_a_complete_config() {
        let settings = settings_from_str(
            r#"
            [application]
            name = "acqctl test"
            log_level = "debug"

            [capture]
            capacity = 16

            [environment]
            kind = "mock"
            frame_rate_hz = 50.0
            channels = 1
            samples_per_channel = 32

            [process]
            spawn_timeout = "2s"
            close_timeout = "1s"
            "#,
        );
        settings.validate().expect("valid settings");
        assert_eq!(settings.capture.capacity, 16);
        assert_eq!(settings.process.spawn_timeout, Duration::from_secs(2));
    }

    #[test]
    fn process_section_is_optional() {
        let settings = settings_from_str(
            r#"
            [application]
            name = "acqctl test"

            [capture]
            capacity = 8

            [environment]
            kind = "mock"
            "#,
        );
        settings.validate().expect("valid settings");
        assert_eq!(settings.process.spawn_timeout, Duration::from_secs(10));
        assert_eq!(settings.application.log_level, "info");
    }

    #[test]
    fn rejects_zero_capacity() {
        let settings = settings_from_str(
            r#"
            [application]
            name = "acqctl test"

            [capture]
            capacity = 0

            [environment]
            kind = "mock"
            "#,
        );
        let error = settings.validate().expect_err("capacity 0 is invalid");
        assert!(error.to_string().contains("capacity"));
    }

    #[test]
    fn rejects_unknown_environment_kind() {
        let settings = settings_from_str(
            r#"
            [application]
            name = "acqctl test"

            [capture]
            capacity = 4

            [environment]
            kind = "warp_drive"
            "#,
        );
        let error = settings.validate().expect_err("unknown kind");
        assert!(error.to_string().contains("warp_drive"));
    }
}
