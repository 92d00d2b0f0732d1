use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration loading, parsing,
/// validation, or runtime updates through the `config` command.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The specified config file was not found.
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    /// Failed to create the default config file.
    #[error("failed to create default config: {0}")]
    CreateDefault(String),

    /// TOML parsing failed.
    #[error("TOML parse error: {0}")]
    Parse(String),

    /// A config value failed validation.
    #[error("validation error: {field}: {message}")]
    Validation {
        /// The dotted field path (e.g. `ui.show_src_lines`).
        field: String,
        /// Human-readable description of the violation.
        message: String,
    },

    /// The key is not a known configuration name.
    #[error("Unknown configuration: {0}")]
    UnknownKey(String),

    /// A raw value could not be converted to the key's type.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// An I/O error occurred while reading or writing config files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display_contains_path() {
        let err = ConfigError::NotFound(PathBuf::from("/tmp/missing.toml"));
        let msg = format!("{err}");
        assert!(msg.contains("/tmp/missing.toml"));
        assert!(msg.contains("config file not found"));
    }

    #[test]
    fn validation_display_contains_field_and_message() {
        let err = ConfigError::Validation {
            field: "ui.show_src_lines".into(),
            message: "must be at least 1".into(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("ui.show_src_lines"));
        assert!(msg.contains("must be at least 1"));
        assert!(msg.contains("validation error"));
    }

    #[test]
    fn unknown_key_display_names_key() {
        let err = ConfigError::UnknownKey("tab_size".into());
        assert_eq!(err.to_string(), "Unknown configuration: tab_size");
    }

    #[test]
    fn invalid_value_display_names_key() {
        let err = ConfigError::InvalidValue {
            key: "show_frames".into(),
            message: "expected an integer".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("show_frames"));
        assert!(msg.contains("expected an integer"));
    }

    #[test]
    fn io_error_display_contains_inner() {
        let inner = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err = ConfigError::from(inner);
        assert!(err.to_string().contains("file missing"));
    }
}
