//! Configuration for the Brass runtime.
//!
//! Layered loading (defaults, files, `BRASS_*` environment variables,
//! programmatic overrides) and validation of the resulting [`BrassConfig`].

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, ENV_PREFIX, Profile, load_config, load_config_from_file};
pub use schema::{
    BrassConfig, DispatchSettings, LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig,
    SpanEventConfig,
};
pub use validation::validate_config;
