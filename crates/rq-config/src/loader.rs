//! Configuration loader with file and environment variable support.

use crate::{AppConfig, ConfigError, QueueDefinition};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths.
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "reliable-queue.toml",
    "./config/config.toml",
    "/etc/reliable-queue/config.toml",
];

/// Configuration loader.
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides applied on top.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("RELIABLE_QUEUE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply `RELIABLE_QUEUE_QUEUES__<NAME>__<FIELD>` overrides, one per
    /// queue definition field. `<NAME>` is matched case-insensitively
    /// against configured queue names; an override for a name with no
    /// existing entry creates one from defaults.
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        const PREFIX: &str = "RELIABLE_QUEUE_QUEUES__";

        for (key, val) in env::vars() {
            let Some(rest) = key.strip_prefix(PREFIX) else {
                continue;
            };
            let Some((queue_name, field)) = rest.split_once("__") else {
                continue;
            };
            let queue_name = queue_name.to_ascii_lowercase();
            let entry = config
                .queues
                .entry(queue_name)
                .or_insert_with(QueueDefinition::default);

            match field {
                "STORAGE_CONNECTION_STRING" => entry.storage_connection_string = val,
                "MODE" => entry.mode = val,
                "IS_ENABLED" => {
                    if let Ok(b) = val.parse() {
                        entry.is_enabled = b;
                    }
                }
                "CREATE_LISTENER" => {
                    if let Ok(b) = val.parse() {
                        entry.create_listener = b;
                    }
                }
                "DEFAULT_TIMEOUT_SECONDS" => {
                    if let Ok(n) = val.parse() {
                        entry.default_timeout_seconds = n;
                    }
                }
                "MAX_ATTEMPTS" => {
                    if let Ok(n) = val.parse() {
                        entry.max_attempts = n;
                    }
                }
                "TOPIC_AFFINITY_TTL_SECONDS" => {
                    if let Ok(n) = val.parse() {
                        entry.topic_affinity_ttl_seconds = n;
                    }
                }
                "SLIDING_WINDOW_DURATION_SECONDS" => {
                    if let Ok(n) = val.parse() {
                        entry.sliding_window_duration_seconds = n;
                    }
                }
                _ => {}
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn finds_explicit_path_over_standard_search() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[queues.orders]\nmode = \"Send\"").unwrap();

        let loader = ConfigLoader::with_path(&path);
        let config = loader.load().unwrap();
        assert_eq!(config.queues["orders"].mode, "Send");
    }

    #[test]
    fn env_override_creates_queue_entry() {
        // SAFETY-equivalent: test-local env var, cleaned up immediately.
        std::env::set_var("RELIABLE_QUEUE_QUEUES__ORDERS__MODE", "Receive");
        let mut config = AppConfig::default();
        ConfigLoader::new().apply_env_overrides(&mut config);
        std::env::remove_var("RELIABLE_QUEUE_QUEUES__ORDERS__MODE");

        assert_eq!(config.queues["orders"].mode, "Receive");
    }
}
