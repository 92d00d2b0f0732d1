use regex::Regex;

use crate::config::Config;
use crate::error::ConfigError;

/// Validate a [`Config`], returning all detected violations.
///
/// Returns `Ok(())` when the config is valid, or `Err` with a
/// vector of every validation error found.
pub fn validate(config: &Config) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    if config.ui.show_src_lines == 0 {
        errors.push(ConfigError::Validation {
            field: "ui.show_src_lines".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    if config.remote.host.trim().is_empty() {
        errors.push(ConfigError::Validation {
            field: "remote.host".to_string(),
            message: "must not be empty".to_string(),
        });
    }

    if config.remote.port == Some(0) && config.remote.open.is_none() {
        errors.push(ConfigError::Validation {
            field: "remote.port".to_string(),
            message: "port 0 is only meaningful with remote.open".to_string(),
        });
    }

    for (i, pattern) in config.control.skip_path.iter().enumerate() {
        if let Err(e) = Regex::new(pattern) {
            errors.push(ConfigError::Validation {
                field: format!("control.skip_path[{i}]"),
                message: format!("invalid pattern {pattern:?}: {e}"),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Collapse a validation result to its first error.
pub(crate) fn first_error(errors: Vec<ConfigError>) -> ConfigError {
    errors
        .into_iter()
        .next()
        .unwrap_or_else(|| ConfigError::Validation {
            field: "unknown".to_string(),
            message: "validation failed".to_string(),
        })
}
