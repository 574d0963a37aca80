//! Controller configuration

use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub topology: TopologyConfig,
    pub logging: LoggingConfig,
}

/// What to do when moving local tracks onto a new direct session fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationFailurePolicy {
    /// Log and carry on with the switch
    #[default]
    Continue,
    /// Tear the direct session down and stay on the relayed transport
    Abort,
}

/// Direct-mode switching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Allow direct sessions at all. When off, incoming ones are declined.
    pub enabled: bool,
    /// Disable automatic switching; only explicit start/stop switch modes
    pub manual: bool,
    /// Delay before switching back to direct after a party leaves
    pub fallback_delay_secs: u64,
    /// Policy for failed local track migration
    pub migration_failure: MigrationFailurePolicy,
    /// Only moderators may initiate or accept direct sessions
    pub require_moderator: bool,
    /// Pass STUN/TURN servers to the direct session
    pub use_stun_turn: bool,
    /// ICE server URLs handed to new direct sessions
    pub ice_servers: Vec<String>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            manual: false,
            fallback_delay_secs: 5,
            migration_failure: MigrationFailurePolicy::Continue,
            require_moderator: true,
            use_stun_turn: true,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
        }
    }
}

impl TopologyConfig {
    #[must_use]
    pub const fn fallback_delay(&self) -> Duration {
        Duration::from_secs(self.fallback_delay_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ice_servers.iter().any(|s| s.trim().is_empty()) {
            return Err(Error::InvalidConfig("empty ICE server URL".to_string()));
        }
        if self.use_stun_turn && self.ice_servers.is_empty() {
            warn!("use_stun_turn is set but no ICE servers are configured");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // SYNCTV_TOPOLOGY_TOPOLOGY__FALLBACK_DELAY_SECS, etc.
        builder = builder.add_source(
            Environment::with_prefix("SYNCTV_TOPOLOGY")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("topology.ice_servers")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(path))
    }

    pub fn validate(&self) -> Result<()> {
        self.topology.validate()?;
        match self.logging.format.as_str() {
            "json" | "pretty" => Ok(()),
            other => Err(Error::InvalidConfig(format!("unknown log format: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.topology.enabled);
        assert!(!config.topology.manual);
        assert_eq!(config.topology.fallback_delay(), Duration::from_secs(5));
        assert_eq!(config.topology.migration_failure, MigrationFailurePolicy::Continue);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            concat!(
                "[topology]\nmanual = true\nfallback_delay_secs = 2\n",
                "migration_failure = \"abort\"\n\n[logging]\nformat = \"json\"",
            )
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert!(config.topology.manual);
        assert_eq!(config.topology.fallback_delay_secs, 2);
        assert_eq!(config.topology.migration_failure, MigrationFailurePolicy::Abort);
        assert_eq!(config.logging.format, "json");
        // Untouched fields keep their defaults
        assert!(config.topology.enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.topology.ice_servers.push("  ".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }
}
