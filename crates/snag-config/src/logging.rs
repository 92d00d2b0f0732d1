//! Log file placement, rotation, and filter construction.
//!
//! The `tracing-subscriber` setup itself lives in the binary crate; this
//! module only decides where logs go and which directives are active.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::{LogConfig, LogLevel};
use crate::paths::SnagPaths;

/// Maximum size of a single log file before rotation (4 MB).
pub const DEFAULT_MAX_LOG_SIZE: u64 = 4 * 1024 * 1024;

/// Maximum number of rotated log files to retain.
pub const DEFAULT_MAX_LOG_FILES: u32 = 3;

/// Crates whose events are governed by the configured level.
const LOG_TARGETS: &[&str] = &["snag", "snag_core", "snag_ui", "snag_config"];

/// Resolve the log file: the configured path or `<log_dir>/snag.log`.
pub fn log_file_path(config: &LogConfig, paths: &SnagPaths) -> PathBuf {
    config
        .file
        .clone()
        .unwrap_or_else(|| paths.log_dir().join("snag.log"))
}

/// Ensure the parent directory of a log file exists.
pub fn ensure_log_dir(log_path: &Path) -> io::Result<()> {
    match log_path.parent() {
        Some(parent) if !parent.exists() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Rotate `snag.log` → `snag.log.1` → ... once it exceeds `max_size`.
///
/// The file numbered `max_files` is discarded.
pub fn rotate_log_files(log_path: &Path, max_size: u64, max_files: u32) -> io::Result<()> {
    if !log_path.exists() || fs::metadata(log_path)?.len() < max_size {
        return Ok(());
    }

    let oldest = rotated_path(log_path, max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for i in (1..max_files).rev() {
        let from = rotated_path(log_path, i);
        if from.exists() {
            fs::rename(&from, rotated_path(log_path, i + 1))?;
        }
    }
    fs::rename(log_path, rotated_path(log_path, 1))
}

/// Build an `EnvFilter` directive string for `level`.
///
/// Only the workspace crates log at the configured level; everything
/// else is held at `warn`.
pub fn filter_directives(level: LogLevel) -> String {
    let mut parts = vec!["warn".to_string()];
    parts.extend(
        LOG_TARGETS
            .iter()
            .map(|target| format!("{target}={}", level.as_str())),
    );
    parts.join(",")
}

// ── internal helpers ────────────────────────────────────────────────────────

fn rotated_path(base: &Path, index: u32) -> PathBuf {
    let name = base.file_name().unwrap_or_default().to_string_lossy();
    let parent = base.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!("{}.{}", name, index))
}

// ── tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_file_wins_over_default() {
        let paths = SnagPaths::with_home(PathBuf::from("/home/u"));
        let cfg = LogConfig {
            level: LogLevel::Info,
            file: Some(PathBuf::from("/var/log/dbg.log")),
        };
        assert_eq!(log_file_path(&cfg, &paths), PathBuf::from("/var/log/dbg.log"));
        let default = log_file_path(&LogConfig::default(), &paths);
        assert!(default.ends_with("logs/snag.log"), "{default:?}");
    }

    #[test]
    fn rotate_no_op_when_file_small() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("snag.log");
        fs::write(&log, "small").unwrap();
        rotate_log_files(&log, DEFAULT_MAX_LOG_SIZE, DEFAULT_MAX_LOG_FILES).unwrap();
        assert!(log.exists());
    }

    #[test]
    fn rotate_cascades_and_drops_oldest() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("snag.log");
        fs::write(dir.path().join("snag.log.1"), "old1").unwrap();
        fs::write(dir.path().join("snag.log.2"), "old2").unwrap();
        fs::write(&log, "x".repeat(200)).unwrap();

        rotate_log_files(&log, 50, 2).unwrap();

        assert!(!log.exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("snag.log.2")).unwrap(),
            "old1"
        );
        assert!(fs::read_to_string(dir.path().join("snag.log.1"))
            .unwrap()
            .starts_with('x'));
    }

    #[test]
    fn ensure_log_dir_creates_nested_parents() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("a").join("b").join("snag.log");
        ensure_log_dir(&log).unwrap();
        ensure_log_dir(&log).unwrap();
        assert!(dir.path().join("a").join("b").exists());
    }

    #[test]
    fn filter_directives_cover_workspace_crates() {
        let f = filter_directives(LogLevel::Debug);
        assert!(f.starts_with("warn,"));
        assert!(f.contains("snag_core=debug"));
        assert!(f.contains("snag_ui=debug"));
    }
}
