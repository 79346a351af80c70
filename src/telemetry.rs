//! Structured logging setup.
//!
//! Built on `tracing` and `tracing-subscriber`: environment-based filtering
//! (`RUST_LOG` wins over the configured level), selectable output format and
//! thread names in every event — worker threads are named after their role
//! (`dispatch-*`, `env-results-*`, `mock-acq-*`), which makes interleaved
//! logs readable.
//!
//! The environment worker process variant logs to **stderr**: its stdout is
//! the reply pipe and must carry nothing but protocol lines.

use crate::config::Settings;
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Output format for log events.
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Pretty-printed with colors (development).
    Pretty,
    /// Compact single lines without colors (production, worker processes).
    Compact,
    /// JSON for log aggregation.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub level: Level,
    pub format: OutputFormat,
    pub with_thread_names: bool,
    /// Write to stderr instead of stdout.
    pub to_stderr: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_thread_names: true,
            to_stderr: false,
        }
    }
}

impl TelemetryConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Read the level from loaded settings.
    pub fn from_settings(settings: &Settings) -> Result<Self, String> {
        let level = parse_log_level(&settings.application.log_level)?;
        Ok(Self::new(level))
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn to_stderr(mut self, enabled: bool) -> Self {
        self.to_stderr = enabled;
        self
    }
}

/// Initialize the global subscriber. Idempotent: a second call (tests,
/// worker re-entry) is a no-op.
pub fn init(config: &TelemetryConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string().to_lowercase()));

    let result = match config.format {
        OutputFormat::Pretty => {
            let layer = fmt::layer()
                .pretty()
                .with_thread_names(config.with_thread_names)
                .with_writer(writer(config.to_stderr))
                .with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
        OutputFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_ansi(false)
                .with_thread_names(config.with_thread_names)
                .with_writer(writer(config.to_stderr))
                .with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
        OutputFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_thread_names(config.with_thread_names)
                .with_writer(writer(config.to_stderr))
                .with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
    };

    result.or_else(|error| {
        // Already initialized is expected in tests and nested setups.
        if error
            .to_string()
            .contains("a global default trace dispatcher has already been set")
        {
            Ok(())
        } else {
            Err(format!("failed to initialize tracing: {error}"))
        }
    })
}

/// Subscriber setup for the environment worker process: compact, stderr.
pub fn init_worker() -> Result<(), String> {
    init(
        &TelemetryConfig::new(Level::INFO)
            .with_format(OutputFormat::Compact)
            .to_stderr(true),
    )
}

fn writer(to_stderr: bool) -> fmt::writer::BoxMakeWriter {
    if to_stderr {
        fmt::writer::BoxMakeWriter::new(std::io::stderr)
    } else {
        fmt::writer::BoxMakeWriter::new(std::io::stdout)
    }
}

/// Parse a configured log level string.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_levels_case_insensitively() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("INFO"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("Warn"), Ok(Level::WARN)));
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn config_builder_applies_options() {
        let config = TelemetryConfig::new(Level::DEBUG)
            .with_format(OutputFormat::Json)
            .to_stderr(true);
        assert!(matches!(config.level, Level::DEBUG));
        assert!(matches!(config.format, OutputFormat::Json));
        assert!(config.to_stderr);
    }
}
