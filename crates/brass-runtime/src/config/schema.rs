//! Configuration schema definitions.
//!
//! ```toml
//! [logging]
//! level = "debug"
//! format = "pretty"
//!
//! [logging.filters]
//! brass_framework = "trace"
//!
//! [dispatch]
//! handler_timeout_ms = 10000
//! shutdown_grace_ms = 3000
//!
//! [adapters.console]
//! prompt = "> "
//!
//! [plugins.greeter]
//! greeting = "howdy"
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use brass_framework::DispatchConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BrassConfig {
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Dispatcher and shutdown settings.
    #[serde(default)]
    pub dispatch: DispatchSettings,

    /// Adapter sections, keyed by adapter name.
    #[serde(default)]
    pub adapters: HashMap<String, Value>,

    /// Plugin sections, keyed by plugin name.
    #[serde(default)]
    pub plugins: HashMap<String, Value>,
}

// =============================================================================
// Dispatch
// =============================================================================

/// Dispatcher and shutdown settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Default deadline for one handler invocation in milliseconds.
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,

    /// How long `stop` waits for in-flight dispatches before cancelling them.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Capacity of each adapter's event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            handler_timeout_ms: default_handler_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl DispatchSettings {
    /// Default handler deadline.
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    /// Shutdown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Converts to the dispatcher's settings.
    pub fn to_dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            handler_timeout: self.handler_timeout(),
        }
    }
}

fn default_handler_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_event_buffer() -> usize {
    256
}

// =============================================================================
// Logging
// =============================================================================

/// Log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Everything, including per-event tracing.
    Trace,
    /// Diagnostic detail.
    Debug,
    /// Lifecycle milestones.
    #[default]
    Info,
    /// Recoverable problems.
    Warn,
    /// Failures only.
    Error,
}

impl LogLevel {
    /// Returns the level as a filter directive string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Converts to a `tracing` level.
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single line, abbreviated fields.
    #[default]
    Compact,
    /// Single line with all fields.
    Full,
    /// Multi-line, for development.
    Pretty,
    /// Requires the `json-log` feature; falls back to `full` without it.
    Json,
}

/// Log destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// Standard output.
    #[default]
    Stdout,
    /// Standard error.
    Stderr,
    /// Rolling file at `file_path`.
    File,
}

/// Log file rotation period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    /// New file every minute.
    Minutely,
    /// New file every hour.
    Hourly,
    /// New file every day.
    Daily,
    /// A single file.
    #[default]
    Never,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanEventConfig {
    /// Log span creation.
    pub new: bool,
    /// Log each span entry.
    pub enter: bool,
    /// Log each span exit.
    pub exit: bool,
    /// Log span close with timing.
    pub close: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Global level.
    #[serde(default)]
    pub level: LogLevel,

    /// Line format.
    #[serde(default)]
    pub format: LogFormat,

    /// Destination.
    #[serde(default)]
    pub output: LogOutput,

    /// Span lifecycle events.
    #[serde(default)]
    pub span_events: SpanEventConfig,

    /// Per-module levels, e.g. `brass_framework = "trace"`.
    #[serde(default)]
    pub filters: HashMap<String, LogLevel>,

    /// Include thread ids.
    #[serde(default)]
    pub thread_ids: bool,

    /// Include file and line.
    #[serde(default)]
    pub file_location: bool,

    /// Log file path, required when `output = "file"`.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    /// Log file rotation.
    #[serde(default)]
    pub rotation: LogRotation,

    /// Maximum number of rotated files kept. `0` keeps all.
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            span_events: SpanEventConfig::default(),
            filters: HashMap::new(),
            thread_ids: false,
            file_location: false,
            file_path: None,
            rotation: LogRotation::default(),
            max_files: default_max_files(),
        }
    }
}

fn default_max_files() -> usize {
    5
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: BrassConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.dispatch.handler_timeout(), Duration::from_secs(30));
        assert_eq!(config.dispatch.event_buffer, 256);
        assert!(config.adapters.is_empty());
    }

    #[test]
    fn test_sections_are_kept_raw() {
        let config: BrassConfig = serde_json::from_value(json!({
            "logging": {"level": "debug", "format": "pretty", "filters": {"brass_core": "trace"}},
            "dispatch": {"handler_timeout_ms": 1500},
            "plugins": {"greeter": {"greeting": "howdy"}}
        }))
        .unwrap();

        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.logging.filters["brass_core"], LogLevel::Trace);
        assert_eq!(
            config.dispatch.to_dispatch_config().handler_timeout,
            Duration::from_millis(1500)
        );
        assert_eq!(config.dispatch.shutdown_grace_ms, 5_000);
        assert_eq!(config.plugins["greeter"]["greeting"], "howdy");
    }
}
