//! Launcher configuration.
//!
//! Settings of the `zombie` binary itself, loaded from TOML and overridden by
//! CLI flags. The network description is a separate file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use zombie_orchestrator::ProviderKind;

/// Launcher configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Spawn configuration.
    pub spawn: SpawnConfig,

    /// Key helper configuration.
    pub keys: KeysConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    /// Log format (pretty, json, compact).
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Overrides applied to every network this launcher spawns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    /// Provider replacing the one in the network description.
    pub provider: Option<ProviderKind>,

    /// Spawn concurrency replacing the one in the network description.
    pub spawn_concurrency: Option<usize>,

    /// Parent of the per-run working directories. Defaults to the system temp dir.
    pub work_dir: Option<PathBuf>,
}

impl SpawnConfig {
    /// Returns the working directory of the run in `namespace`.
    pub fn run_dir(&self, namespace: &str) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir).join(namespace)
    }
}

/// Key helper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// `subkey`, or a node binary exposing a `key` subcommand.
    pub program: String,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            program: "subkey".to_string(),
        }
    }
}

impl LauncherConfig {
    /// Loads configuration from a file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merges CLI arguments into the configuration.
    pub fn merge_cli_args(&mut self, args: &super::CliArgs) {
        if let Some(provider) = args.provider {
            self.spawn.provider = Some(provider);
        }
        if let Some(concurrency) = args.spawn_concurrency {
            self.spawn.spawn_concurrency = Some(concurrency);
        }
        if let Some(ref dir) = args.dir {
            self.spawn.work_dir = Some(dir.clone());
        }
        if let Some(ref program) = args.keys_bin {
            self.keys.program = program.clone();
        }
        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid log level: {}", self.logging.level);
        }

        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            anyhow::bail!("Invalid log format: {}", self.logging.format);
        }

        if self.spawn.spawn_concurrency == Some(0) {
            anyhow::bail!("spawn_concurrency must be at least 1");
        }
        if self.keys.program.is_empty() {
            anyhow::bail!("Key helper program is empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LauncherConfig::default();

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "pretty");
        assert!(config.spawn.provider.is_none());
        assert_eq!(config.keys.program, "subkey");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = LauncherConfig::default();

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "debug".to_string();

        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
        config.logging.format = "json".to_string();

        config.spawn.spawn_concurrency = Some(0);
        assert!(config.validate().is_err());
        config.spawn.spawn_concurrency = Some(4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config: LauncherConfig = toml::from_str(
            r#"
[logging]
format = "compact"

[spawn]
provider = "native"
work_dir = "/var/tmp/zombie"
"#,
        )
        .unwrap();

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "compact");
        assert_eq!(config.spawn.provider, Some(ProviderKind::Native));
        assert_eq!(config.spawn.run_dir("zombie-ab12"), PathBuf::from("/var/tmp/zombie/zombie-ab12"));
    }
}
