use std::path::PathBuf;

use crate::error::ConfigError;

/// Standard directories used by the debugger.
#[derive(Debug, Clone)]
pub struct SnagPaths {
    home: PathBuf,
}

impl SnagPaths {
    /// Resolve the home directory via `dirs`, falling back to `$HOME`.
    pub fn new() -> Result<Self, ConfigError> {
        let home = dirs::home_dir()
            .or_else(|| std::env::var("HOME").ok().map(PathBuf::from))
            .ok_or_else(|| ConfigError::Validation {
                field: "home".into(),
                message: "could not determine home directory".into(),
            })?;
        Ok(Self { home })
    }

    /// Build paths rooted at an explicit home directory.
    pub fn with_home(home: PathBuf) -> Self {
        Self { home }
    }

    /// `~/.config/snag`
    pub fn config_dir(&self) -> PathBuf {
        self.home.join(".config").join("snag")
    }

    /// `~/.local/share/snag`
    pub fn data_dir(&self) -> PathBuf {
        self.home.join(".local").join("share").join("snag")
    }

    /// `<data_dir>/logs`
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirs_are_rooted_at_home() {
        let p = SnagPaths::with_home(PathBuf::from("/home/dev"));
        assert_eq!(p.config_dir(), PathBuf::from("/home/dev/.config/snag"));
        assert_eq!(p.log_dir(), PathBuf::from("/home/dev/.local/share/snag/logs"));
    }

    #[test]
    fn new_resolves_some_home() {
        let p = SnagPaths::new().expect("home directory");
        assert!(p.config_dir().ends_with(".config/snag"));
    }
}
