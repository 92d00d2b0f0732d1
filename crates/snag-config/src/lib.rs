pub mod config;
pub mod error;
pub mod keys;
pub mod load;
pub mod logging;
pub mod merge;
pub mod paths;
pub mod validate;

pub use config::{Config, LogLevel, OpenMode};
pub use error::ConfigError;
pub use keys::{find_key, ConfigKey, KeyKind, CONFIG_KEYS};
pub use load::{load_config, load_config_with_env, load_from_str};
pub use paths::SnagPaths;
