//! Configuration validation utilities.

use super::error::{ConfigError, ConfigResult};
use super::schema::{BrassConfig, DispatchSettings, LogOutput, LoggingConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &BrassConfig) -> ConfigResult<()> {
    validate_logging_config(&config.logging)?;
    validate_dispatch_config(&config.dispatch)?;
    validate_section_names("adapters", config.adapters.keys())?;
    validate_section_names("plugins", config.plugins.keys())?;
    Ok(())
}

/// Validates logging settings.
fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::missing_field("logging.file_path"));
    }

    for module in logging.filters.keys() {
        if module.is_empty() || module.contains(char::is_whitespace) {
            return Err(ConfigError::validation(format!(
                "Invalid logging filter target: {module:?}"
            )));
        }
    }

    Ok(())
}

/// Validates dispatcher settings.
fn validate_dispatch_config(dispatch: &DispatchSettings) -> ConfigResult<()> {
    if dispatch.handler_timeout_ms == 0 {
        return Err(ConfigError::validation(
            "dispatch.handler_timeout_ms must be greater than 0",
        ));
    }

    if dispatch.event_buffer == 0 {
        return Err(ConfigError::validation(
            "dispatch.event_buffer must be greater than 0",
        ));
    }

    Ok(())
}

/// Validates adapter or plugin section names.
fn validate_section_names<'a>(
    table: &str,
    names: impl Iterator<Item = &'a String>,
) -> ConfigResult<()> {
    for name in names {
        if name.is_empty() {
            return Err(ConfigError::validation(format!("Empty name in [{table}]")));
        }
        if name.contains(' ') {
            return Err(ConfigError::validation(format!(
                "Name in [{table}] cannot contain spaces: {name:?}"
            )));
        }
    }
    Ok(())
}
