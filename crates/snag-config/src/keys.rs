//! Flat, typed access to configuration values by name.
//!
//! The `config` debugger command and environment-variable overrides both
//! address settings by a short name (`show_frames`, `skip_path`, ...).
//! Updates are expressed as TOML overlays and go through the same merge
//! and validation path as config files.

use crate::config::Config;
use crate::error::ConfigError;
use crate::merge::{from_value, merge_value_into, to_value};
use crate::validate::{first_error, validate};

/// Value type of a configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Int,
    Bool,
    Str,
    Path,
    /// Colon separated list of strings.
    List,
    Level,
    Open,
}

/// One named configuration setting.
#[derive(Debug, Clone, Copy)]
pub struct ConfigKey {
    /// Name used by the `config` command.
    pub name: &'static str,
    /// TOML section holding the field.
    pub section: &'static str,
    /// Field name inside the section.
    pub field: &'static str,
    /// Environment variable that overrides file values.
    pub env: &'static str,
    pub kind: KeyKind,
    pub description: &'static str,
}

const fn key(
    name: &'static str,
    section: &'static str,
    field: &'static str,
    env: &'static str,
    kind: KeyKind,
    description: &'static str,
) -> ConfigKey {
    ConfigKey {
        name,
        section,
        field,
        env,
        kind,
        description,
    }
}

/// Every setting reachable through `config` and the environment.
pub const CONFIG_KEYS: &[ConfigKey] = &[
    key("log_level", "log", "level", "SNAG_LOG_LEVEL", KeyKind::Level, "UI: Log level"),
    key("show_src_lines", "ui", "show_src_lines", "SNAG_SHOW_SRC_LINES", KeyKind::Int, "UI: Show n lines source code on breakpoint"),
    key("show_frames", "ui", "show_frames", "SNAG_SHOW_FRAMES", KeyKind::Int, "UI: Show n frames on breakpoint"),
    key("no_color", "ui", "no_color", "SNAG_NO_COLOR", KeyKind::Bool, "UI: Do not use colorize"),
    key("no_lineno", "ui", "no_lineno", "SNAG_NO_LINENO", KeyKind::Bool, "UI: Do not show line numbers"),
    key("skip_path", "control", "skip_path", "SNAG_SKIP_PATH", KeyKind::List, "CONTROL: Skip showing/entering frames for given paths"),
    key("skip_nosrc", "control", "skip_nosrc", "SNAG_SKIP_NOSRC", KeyKind::Bool, "CONTROL: Skip on no source code lines"),
    key("postmortem", "control", "postmortem", "SNAG_POSTMORTEM", KeyKind::Bool, "CONTROL: Enable postmortem debug"),
    key("nonstop", "boot", "nonstop", "SNAG_NONSTOP", KeyKind::Bool, "BOOT: Nonstop mode"),
    key("stop_at_load", "boot", "stop_at_load", "SNAG_STOP_AT_LOAD", KeyKind::Bool, "BOOT: Stop at every code load"),
    key("init_script", "boot", "init_script", "SNAG_INIT_SCRIPT", KeyKind::Path, "BOOT: debug command script path loaded at first stop"),
    key("commands", "boot", "commands", "SNAG_COMMANDS", KeyKind::Str, "BOOT: debug commands invoked at first stop. Commands are separated by `;`"),
    key("open", "remote", "open", "SNAG_OPEN", KeyKind::Open, "REMOTE: Open remote port (tcp, vscode, chrome)"),
    key("host", "remote", "host", "SNAG_HOST", KeyKind::Str, "REMOTE: TCP/IP remote debugging: host"),
    key("port", "remote", "port", "SNAG_PORT", KeyKind::Int, "REMOTE: TCP/IP remote debugging: port"),
    key("cookie", "remote", "cookie", "SNAG_COOKIE", KeyKind::Str, "REMOTE: Cookie for negotiation"),
    key("session_name", "remote", "session_name", "SNAG_SESSION_NAME", KeyKind::Str, "REMOTE: Session name for differentiating multiple sessions"),
];

/// Look up a key by its `config` command name.
pub fn find_key(name: &str) -> Option<&'static ConfigKey> {
    CONFIG_KEYS.iter().find(|k| k.name == name)
}

fn lookup(name: &str) -> Result<&'static ConfigKey, ConfigError> {
    find_key(name).ok_or_else(|| ConfigError::UnknownKey(name.to_string()))
}

fn invalid(key: &ConfigKey, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.name.to_string(),
        message: message.into(),
    }
}

fn parse_raw(key: &ConfigKey, raw: &str) -> Result<toml::Value, ConfigError> {
    let raw = raw.trim();
    match key.kind {
        KeyKind::Int => raw
            .parse::<i64>()
            .map(toml::Value::Integer)
            .map_err(|_| invalid(key, format!("expected an integer, got {raw:?}"))),
        KeyKind::Bool => match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(toml::Value::Boolean(true)),
            "false" | "no" | "off" | "0" => Ok(toml::Value::Boolean(false)),
            _ => Err(invalid(key, format!("expected true or false, got {raw:?}"))),
        },
        KeyKind::List => Ok(toml::Value::Array(
            raw.split(':')
                .filter(|s| !s.is_empty())
                .map(|s| toml::Value::String(s.to_string()))
                .collect(),
        )),
        KeyKind::Str | KeyKind::Path | KeyKind::Level | KeyKind::Open => {
            Ok(toml::Value::String(raw.to_string()))
        }
    }
}

fn overlay(key: &ConfigKey, value: toml::Value) -> toml::Value {
    let mut inner = toml::map::Map::new();
    inner.insert(key.field.to_string(), value);
    let mut outer = toml::map::Map::new();
    outer.insert(key.section.to_string(), toml::Value::Table(inner));
    toml::Value::Table(outer)
}

fn field_of<'a>(root: &'a toml::Value, key: &ConfigKey) -> Option<&'a toml::Value> {
    root.get(key.section).and_then(|s| s.get(key.field))
}

impl Config {
    /// Render the current value of `name`, or `None` when unset.
    pub fn get(&self, name: &str) -> Result<Option<String>, ConfigError> {
        let key = lookup(name)?;
        let root = to_value(self)?;
        Ok(field_of(&root, key).map(|v| v.to_string()))
    }

    /// Replace the value of `name` with `raw`.
    ///
    /// The configuration is left untouched when the new value fails to
    /// parse or validate.
    pub fn set(&mut self, name: &str, raw: &str) -> Result<(), ConfigError> {
        let key = lookup(name)?;
        let value = parse_raw(key, raw)?;
        self.apply_overlay(key, overlay(key, value))
    }

    /// Append `raw` to a list-valued key.
    pub fn append(&mut self, name: &str, raw: &str) -> Result<(), ConfigError> {
        let key = lookup(name)?;
        if key.kind != KeyKind::List {
            return Err(invalid(key, "is not a list"));
        }
        let root = to_value(self)?;
        let mut items = match field_of(&root, key) {
            Some(toml::Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        if let toml::Value::Array(extra) = parse_raw(key, raw)? {
            items.extend(extra);
        }
        self.apply_overlay(key, overlay(key, toml::Value::Array(items)))
    }

    /// Reset `name` to its default value.
    pub fn unset(&mut self, name: &str) -> Result<(), ConfigError> {
        let key = lookup(name)?;
        let default_root = to_value(&Config::default())?;
        let mut root = to_value(self)?;
        if let Some(toml::Value::Table(section)) = root.get_mut(key.section) {
            match field_of(&default_root, key) {
                Some(v) => {
                    section.insert(key.field.to_string(), v.clone());
                }
                None => {
                    section.remove(key.field);
                }
            }
        }
        *self = from_value(root)?;
        Ok(())
    }

    /// Apply environment overrides. `env` maps a variable name to its value.
    pub fn with_env<F>(mut self, env: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in CONFIG_KEYS {
            if let Some(raw) = env(key.env) {
                tracing::debug!(key = key.name, env = key.env, "config overridden by environment");
                self.set(key.name, &raw)?;
            }
        }
        Ok(self)
    }

    fn apply_overlay(&mut self, key: &ConfigKey, value: toml::Value) -> Result<(), ConfigError> {
        let candidate = merge_value_into(self, &value).map_err(|e| match e {
            ConfigError::Parse(msg) => invalid(key, msg),
            other => other,
        })?;
        validate(&candidate).map_err(first_error)?;
        *self = candidate;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogLevel, OpenMode};
    use std::collections::HashMap;

    #[test]
    fn every_key_resolves_against_defaults() {
        let cfg = Config::default();
        for key in CONFIG_KEYS {
            assert!(cfg.get(key.name).is_ok(), "{} should be gettable", key.name);
        }
    }

    #[test]
    fn set_and_get_integer() {
        let mut cfg = Config::default();
        cfg.set("show_frames", "5").unwrap();
        assert_eq!(cfg.ui.show_frames, 5);
        assert_eq!(cfg.get("show_frames").unwrap().as_deref(), Some("5"));
    }

    #[test]
    fn set_rejects_bad_integer_and_keeps_value() {
        let mut cfg = Config::default();
        let err = cfg.set("show_src_lines", "lots").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert_eq!(cfg.ui.show_src_lines, 10);
    }

    #[test]
    fn set_runs_validation() {
        let mut cfg = Config::default();
        assert!(cfg.set("show_src_lines", "0").is_err());
        assert_eq!(cfg.ui.show_src_lines, 10);
    }

    #[test]
    fn set_enum_values() {
        let mut cfg = Config::default();
        cfg.set("log_level", "debug").unwrap();
        cfg.set("open", "chrome").unwrap();
        assert_eq!(cfg.log.level, LogLevel::Debug);
        assert_eq!(cfg.remote.open, Some(OpenMode::Chrome));
        assert!(cfg.set("open", "telnet").is_err());
    }

    #[test]
    fn append_and_unset_list() {
        let mut cfg = Config::default();
        cfg.set("skip_path", "/gems/").unwrap();
        cfg.append("skip_path", "/vendor/:/lib/").unwrap();
        assert_eq!(cfg.control.skip_path, vec!["/gems/", "/vendor/", "/lib/"]);
        cfg.unset("skip_path").unwrap();
        assert!(cfg.control.skip_path.is_empty());
    }

    #[test]
    fn append_to_scalar_fails() {
        let mut cfg = Config::default();
        assert!(cfg.append("show_frames", "3").is_err());
    }

    #[test]
    fn unset_optional_removes_value() {
        let mut cfg = Config::default();
        cfg.set("cookie", "abc").unwrap();
        assert_eq!(cfg.remote.cookie.as_deref(), Some("abc"));
        cfg.unset("cookie").unwrap();
        assert!(cfg.remote.cookie.is_none());
        assert_eq!(cfg.get("cookie").unwrap(), None);
    }

    #[test]
    fn unknown_key_is_reported() {
        let mut cfg = Config::default();
        assert!(matches!(
            cfg.set("tab_size", "4"),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn env_overrides_take_precedence() {
        let env: HashMap<&str, &str> = [("SNAG_SHOW_FRAMES", "9"), ("SNAG_NO_COLOR", "1")]
            .into_iter()
            .collect();
        let mut base = Config::default();
        base.ui.show_frames = 3;
        let cfg = base
            .with_env(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.ui.show_frames, 9);
        assert!(cfg.ui.no_color);
    }
}
