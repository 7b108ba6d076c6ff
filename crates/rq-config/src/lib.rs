//! Reliable queue configuration system.
//!
//! TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("invalid configuration for queue {queue}: {message}")]
    ValidationError { queue: String, message: String },
}

/// Delivery mode for a configured queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum QueueMode {
    Send,
    Receive,
    Both,
}

impl QueueMode {
    pub fn can_send(&self) -> bool {
        matches!(self, QueueMode::Send | QueueMode::Both)
    }

    pub fn can_receive(&self) -> bool {
        matches!(self, QueueMode::Receive | QueueMode::Both)
    }

    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.to_ascii_lowercase().as_str() {
            "send" => Ok(QueueMode::Send),
            "receive" => Ok(QueueMode::Receive),
            "both" => Ok(QueueMode::Both),
            other => Err(ConfigError::ValidationError {
                queue: String::new(),
                message: format!("unknown mode '{other}', expected Send|Receive|Both"),
            }),
        }
    }
}

/// Per-queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDefinition {
    pub storage_connection_string: String,
    pub mode: String,
    pub is_enabled: bool,
    pub create_listener: bool,
    pub default_timeout_seconds: u64,
    pub max_attempts: u32,
    pub topic_affinity_ttl_seconds: u64,
    pub sliding_window_duration_seconds: u64,
}

impl Default for QueueDefinition {
    fn default() -> Self {
        Self {
            storage_connection_string: String::new(),
            mode: "Both".to_string(),
            is_enabled: true,
            create_listener: true,
            default_timeout_seconds: 30,
            max_attempts: 5,
            topic_affinity_ttl_seconds: 60,
            sliding_window_duration_seconds: 2,
        }
    }
}

impl QueueDefinition {
    /// Validate and parse the mode field. A malformed mode is a fatal
    /// `ConfigError` at startup.
    pub fn parsed_mode(&self, queue_name: &str) -> Result<QueueMode, ConfigError> {
        QueueMode::parse(&self.mode).map_err(|_| ConfigError::ValidationError {
            queue: queue_name.to_string(),
            message: format!("mode must be one of Send, Receive, Both; got '{}'", self.mode),
        })
    }
}

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub queues: HashMap<String, QueueDefinition>,
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Validate every configured queue, failing fast on malformed mode
    /// strings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, def) in &self.queues {
            def.parsed_mode(name)?;
        }
        Ok(())
    }

    /// Enabled queue definitions only; disabled entries are ignored.
    pub fn enabled_queues(&self) -> impl Iterator<Item = (&String, &QueueDefinition)> {
        self.queues.iter().filter(|(_, def)| def.is_enabled)
    }

    pub fn example_toml() -> String {
        r#"# Reliable Queue Configuration
# Environment variables override these settings

[queues.orders]
storage_connection_string = ""
mode = "Both"            # Send, Receive, or Both
is_enabled = true
create_listener = true
default_timeout_seconds = 30
max_attempts = 5
topic_affinity_ttl_seconds = 60
sliding_window_duration_seconds = 2
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mode_case_insensitively() {
        let mut def = QueueDefinition::default();
        def.mode = "send".to_string();
        assert_eq!(def.parsed_mode("q").unwrap(), QueueMode::Send);
        def.mode = "RECEIVE".to_string();
        assert_eq!(def.parsed_mode("q").unwrap(), QueueMode::Receive);
    }

    #[test]
    fn rejects_unknown_mode() {
        let mut def = QueueDefinition::default();
        def.mode = "broadcast".to_string();
        assert!(def.parsed_mode("q").is_err());
    }

    #[test]
    fn disabled_queues_are_excluded() {
        let mut cfg = AppConfig::default();
        cfg.queues.insert(
            "a".to_string(),
            QueueDefinition {
                is_enabled: false,
                ..Default::default()
            },
        );
        cfg.queues.insert("b".to_string(), QueueDefinition::default());
        let names: Vec<_> = cfg.enabled_queues().map(|(n, _)| n.clone()).collect();
        assert_eq!(names, vec!["b".to_string()]);
    }
}
