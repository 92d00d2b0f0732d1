use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Log verbosity level.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Most verbose.
    Trace,
    /// Debug messages.
    Debug,
    /// Informational messages (default).
    #[default]
    Info,
    /// Warnings only.
    Warn,
    /// Errors only.
    Error,
}

impl LogLevel {
    /// The lowercase name used in config files and filters.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Which front end the debugger opens at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// Plain TCP listener speaking the line protocol (and DAP/CDP by detection).
    Tcp,
    /// Listener intended for a DAP client such as VSCode.
    Vscode,
    /// Listener intended for Chrome devtools.
    Chrome,
}

impl OpenMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OpenMode::Tcp => "tcp",
            OpenMode::Vscode => "vscode",
            OpenMode::Chrome => "chrome",
        }
    }
}

/// Console presentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiConfig {
    /// Lines of source shown around the stop location.
    #[serde(default = "default_show_src_lines")]
    pub show_src_lines: usize,
    /// Frames shown on each stop.
    #[serde(default = "default_show_frames")]
    pub show_frames: usize,
    /// Disable colorized output.
    #[serde(default)]
    pub no_color: bool,
    /// Hide line numbers in source listings.
    #[serde(default)]
    pub no_lineno: bool,
}

fn default_show_src_lines() -> usize {
    10
}

fn default_show_frames() -> usize {
    2
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            show_src_lines: default_show_src_lines(),
            show_frames: default_show_frames(),
            no_color: false,
            no_lineno: false,
        }
    }
}

/// Execution control.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Regex patterns of paths that stepping never stops in.
    #[serde(default)]
    pub skip_path: Vec<String>,
    /// Skip locations whose source is unavailable.
    #[serde(default)]
    pub skip_nosrc: bool,
    /// Enter post-mortem mode on an unhandled exception.
    #[serde(default)]
    pub postmortem: bool,
}

/// Startup behaviour.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootConfig {
    /// Do not stop at the beginning of the program.
    #[serde(default)]
    pub nonstop: bool,
    /// Stop every time a compiled-code unit is loaded.
    #[serde(default)]
    pub stop_at_load: bool,
    /// Debugger command script run at startup.
    #[serde(default)]
    pub init_script: Option<PathBuf>,
    /// Semicolon separated commands run at the first stop.
    #[serde(default)]
    pub commands: Option<String>,
}

/// Remote front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Open a remote transport instead of the local console.
    #[serde(default)]
    pub open: Option<OpenMode>,
    /// Listen address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port (0 or absent picks an ephemeral port).
    #[serde(default)]
    pub port: Option<u16>,
    /// Shared secret required by the line-protocol handshake.
    #[serde(default)]
    pub cookie: Option<String>,
    /// Name reported to remote clients.
    #[serde(default)]
    pub session_name: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            open: None,
            host: default_host(),
            port: None,
            cookie: None,
            session_name: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log verbosity level.
    #[serde(default)]
    pub level: LogLevel,
    /// Optional path to a log file.
    pub file: Option<PathBuf>,
}

/// Top-level debugger configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub boot: BootConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Split `boot.commands` into individual command lines.
    pub fn boot_commands(&self) -> Vec<String> {
        self.boot
            .commands
            .as_deref()
            .map(|s| {
                s.split(';')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = Config::default();
        assert_eq!(cfg.ui.show_src_lines, 10);
        assert_eq!(cfg.ui.show_frames, 2);
        assert!(!cfg.ui.no_color);
        assert!(cfg.control.skip_path.is_empty());
        assert!(!cfg.control.postmortem);
        assert!(!cfg.boot.nonstop);
        assert!(cfg.remote.open.is_none());
        assert_eq!(cfg.remote.host, "127.0.0.1");
        assert_eq!(cfg.log.level, LogLevel::Info);
        assert!(cfg.log.file.is_none());
    }

    #[test]
    fn serde_roundtrip_preserves_values() {
        let cfg = Config {
            ui: UiConfig {
                show_src_lines: 4,
                show_frames: 8,
                no_color: true,
                no_lineno: true,
            },
            control: ControlConfig {
                skip_path: vec!["/vendor/".into()],
                skip_nosrc: true,
                postmortem: true,
            },
            boot: BootConfig {
                nonstop: true,
                stop_at_load: false,
                init_script: Some(PathBuf::from("/tmp/init.snag")),
                commands: Some("bt;info".into()),
            },
            remote: RemoteConfig {
                open: Some(OpenMode::Chrome),
                host: "0.0.0.0".into(),
                port: Some(12345),
                cookie: Some("s3cret".into()),
                session_name: None,
            },
            log: LogConfig {
                level: LogLevel::Debug,
                file: Some(PathBuf::from("/tmp/snag.log")),
            },
        };

        let toml_str = toml::to_string(&cfg).expect("serialize");
        let deserialized: Config = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(cfg, deserialized);
    }

    #[test]
    fn parse_partial_toml_keeps_defaults() {
        let input = r#"
[ui]
show_frames = 5

[remote]
open = "vscode"
"#;
        let cfg: Config = toml::from_str(input).expect("parse toml");
        assert_eq!(cfg.ui.show_frames, 5);
        assert_eq!(cfg.ui.show_src_lines, 10);
        assert_eq!(cfg.remote.open, Some(OpenMode::Vscode));
        assert_eq!(cfg.remote.host, "127.0.0.1");
    }

    #[test]
    fn boot_commands_split_on_semicolons() {
        let mut cfg = Config::default();
        cfg.boot.commands = Some(" b app.rb:3 ;; c ".into());
        assert_eq!(cfg.boot_commands(), vec!["b app.rb:3", "c"]);
        assert!(Config::default().boot_commands().is_empty());
    }
}
