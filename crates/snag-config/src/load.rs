use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::ConfigError;
use crate::merge::merge_configs;
use crate::validate::{first_error, validate};

/// Content written into a newly-created default config file.
const DEFAULT_CONFIG_CONTENT: &str = r#"# snag debugger configuration
# Uncomment and edit settings below to override defaults.
# Every setting can also be overridden with a SNAG_* environment variable.

# [ui]
# show_src_lines = 10
# show_frames = 2
# no_color = false

# [control]
# skip_path = ["/vendor/"]
# postmortem = false

# [boot]
# nonstop = false
# commands = "b app.rb:10"

# [remote]
# open = "tcp"
# host = "127.0.0.1"
# port = 12345

# [log]
# level = "info"
"#;

/// Load and merge configuration.
///
/// 1. Reads the global config from `config_dir/config.toml`, creating it
///    with commented-out defaults when missing.
/// 2. Optionally reads a project config from `project_dir/.snag/config.toml`
///    (walks upward).
/// 3. Applies `SNAG_*` environment overrides from the process environment.
/// 4. Validates the merged result.
pub fn load_config(config_dir: &Path, project_dir: Option<&Path>) -> Result<Config, ConfigError> {
    load_config_with_env(config_dir, project_dir, |name| std::env::var(name).ok())
}

/// Same as [`load_config`] with an explicit environment lookup.
pub fn load_config_with_env<F>(
    config_dir: &Path,
    project_dir: Option<&Path>,
    env: F,
) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let global_path = config_dir.join("config.toml");

    if !config_dir.exists() {
        std::fs::create_dir_all(config_dir)?;
    }

    if !global_path.exists() {
        std::fs::write(&global_path, DEFAULT_CONFIG_CONTENT)
            .map_err(|e| ConfigError::CreateDefault(e.to_string()))?;
        tracing::info!("Created default config at {}", global_path.display());
    }

    let mut config = Config::default();

    let global_content = std::fs::read_to_string(&global_path)?;
    if has_non_comment_content(&global_content) {
        config = merge_configs(&config, &global_content)?;
    }

    if let Some(proj) = project_dir {
        if let Some(project_path) = find_project_config(proj) {
            tracing::debug!("Merging project config {}", project_path.display());
            let project_content = std::fs::read_to_string(&project_path)?;
            config = merge_configs(&config, &project_content)?;
        }
    }

    let config = config.with_env(env)?;
    validate(&config).map_err(first_error)?;
    Ok(config)
}

/// Walk from `start` upward looking for `.snag/config.toml`.
fn find_project_config(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(".snag").join("config.toml");
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

fn has_non_comment_content(content: &str) -> bool {
    content.lines().any(|l| {
        let trimmed = l.trim();
        !trimmed.is_empty() && !trimmed.starts_with('#')
    })
}

/// Parse a TOML string directly into a validated [`Config`].
pub fn load_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(&config).map_err(first_error)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn load_config_creates_default_when_missing() {
        let tmp = TempDir::new().unwrap();
        let cfg_dir = tmp.path().join("config");

        let config = load_config_with_env(&cfg_dir, None, no_env).unwrap();
        assert_eq!(config, Config::default());
        assert!(cfg_dir.join("config.toml").exists());
    }

    #[test]
    fn load_config_merges_project_over_global() {
        let tmp = TempDir::new().unwrap();
        let cfg_dir = tmp.path().join("config");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            "[ui]\nshow_frames = 8\nshow_src_lines = 4\n",
        )
        .unwrap();

        let proj_dir = tmp.path().join("project");
        let snag_dir = proj_dir.join(".snag");
        std::fs::create_dir_all(&snag_dir).unwrap();
        std::fs::write(snag_dir.join("config.toml"), "[ui]\nshow_frames = 3\n").unwrap();

        let config = load_config_with_env(&cfg_dir, Some(&proj_dir), no_env).unwrap();
        assert_eq!(config.ui.show_frames, 3);
        assert_eq!(config.ui.show_src_lines, 4);
    }

    #[test]
    fn env_beats_files() {
        let tmp = TempDir::new().unwrap();
        let cfg_dir = tmp.path().join("config");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(cfg_dir.join("config.toml"), "[remote]\nport = 1000\n").unwrap();

        let config = load_config_with_env(&cfg_dir, None, |name| {
            (name == "SNAG_PORT").then(|| "2000".to_string())
        })
        .unwrap();
        assert_eq!(config.remote.port, Some(2000));
    }

    #[test]
    fn load_from_str_rejects_invalid_values() {
        assert!(load_from_str("[ui]\nshow_src_lines = 0\n").is_err());
        assert!(load_from_str("{{bad}}").is_err());
        assert_eq!(
            load_from_str("[ui]\nshow_frames = 6\n").unwrap().ui.show_frames,
            6
        );
    }

    #[test]
    fn find_project_config_walks_up() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("repo");
        std::fs::create_dir_all(root.join(".snag")).unwrap();
        std::fs::write(root.join(".snag").join("config.toml"), "").unwrap();
        let deep = root.join("src").join("module");
        std::fs::create_dir_all(&deep).unwrap();

        let found = find_project_config(&deep).expect("found");
        assert!(found.ends_with(".snag/config.toml"));
    }

    #[test]
    fn default_content_is_comment_only() {
        assert!(!has_non_comment_content(DEFAULT_CONFIG_CONTENT));
        assert!(has_non_comment_content("# c\n[ui]\n"));
    }
}
