use crate::config::Config;
use crate::error::ConfigError;

/// Merge an overlay TOML fragment on top of a base [`Config`].
///
/// Values present in `overlay_toml` override those in `base`.
/// Missing keys in the overlay keep their `base` values.
pub fn merge_configs(base: &Config, overlay_toml: &str) -> Result<Config, ConfigError> {
    let overlay_val: toml::Value =
        toml::from_str(overlay_toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
    merge_value_into(base, &overlay_val)
}

/// Merge an already-parsed overlay table on top of `base`.
pub(crate) fn merge_value_into(
    base: &Config,
    overlay: &toml::Value,
) -> Result<Config, ConfigError> {
    let mut base_val = to_value(base)?;
    merge_values(&mut base_val, overlay);
    from_value(base_val)
}

pub(crate) fn to_value(config: &Config) -> Result<toml::Value, ConfigError> {
    let text = toml::to_string(config).map_err(|e| ConfigError::Parse(e.to_string()))?;
    toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
}

pub(crate) fn from_value(value: toml::Value) -> Result<Config, ConfigError> {
    value
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))
}

/// Recursively merge `overlay` into `base`.
///
/// Tables are merged key-by-key; all other value types are
/// replaced outright.
fn merge_values(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, val) in overlay_table {
                if let Some(base_val) = base_table.get_mut(key) {
                    merge_values(base_val, val);
                } else {
                    base_table.insert(key.clone(), val.clone());
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_empty_overlay_returns_base() {
        let base = Config::default();
        let merged = merge_configs(&base, "").expect("merge empty");
        assert_eq!(merged, base);
    }

    #[test]
    fn merge_overrides_show_frames_only() {
        let base = Config::default();
        let merged = merge_configs(&base, "[ui]\nshow_frames = 7\n").expect("merge");
        assert_eq!(merged.ui.show_frames, 7);
        assert_eq!(merged.ui.show_src_lines, 10);
    }

    #[test]
    fn merge_replaces_arrays_outright() {
        let mut base = Config::default();
        base.control.skip_path = vec!["a".into(), "b".into()];
        let merged = merge_configs(&base, "[control]\nskip_path = [\"c\"]\n").expect("merge");
        assert_eq!(merged.control.skip_path, vec!["c".to_string()]);
    }

    #[test]
    fn merge_adds_missing_optional_field() {
        let base = Config::default();
        assert!(base.remote.port.is_none());
        let merged = merge_configs(&base, "[remote]\nport = 4000\n").expect("merge");
        assert_eq!(merged.remote.port, Some(4000));
    }

    #[test]
    fn merge_invalid_overlay_returns_parse_error() {
        let base = Config::default();
        assert!(merge_configs(&base, "{{invalid}}").is_err());
    }

    #[test]
    fn merge_wrong_type_is_parse_error() {
        let base = Config::default();
        let err = merge_configs(&base, "[ui]\nshow_frames = \"many\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
