//! # Configuration
//!
//! Manages the loading and parsing of the application's configuration file (`config.yaml`).
//! Every field has a default, so a missing file or a partial file is fine.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration structure.
/// Matches the layout of `data/config.yaml`.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Execution engine tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Delay between attempts while the sandbox is still booting.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Attempts before a drain pass gives up on the sandbox.
    #[serde(default = "default_max_ready_attempts")]
    pub max_ready_attempts: u32,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl EngineConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay_ms(),
            max_ready_attempts: default_max_ready_attempts(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

fn default_retry_delay_ms() -> u64 {
    500
}
fn default_max_ready_attempts() -> u32 {
    50
}
fn default_command_timeout() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Work directory of the local sandbox.
    #[serde(default = "default_sandbox_root")]
    pub root: String,
    /// Simulated boot time before the sandbox becomes available.
    #[serde(default)]
    pub boot_delay_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: default_sandbox_root(),
            boot_delay_ms: 0,
        }
    }
}

fn default_sandbox_root() -> String {
    "./workspace".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Loads configuration from `path`, or from the first default location that exists.
    /// Falls back to defaults when no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(candidate) = Self::locate(path) else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(&candidate)
            .with_context(|| format!("Failed to read {}", candidate.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", candidate.display()))
    }

    /// The file `load` would read: `path` if given, else the first default location that exists.
    pub fn locate(path: Option<&Path>) -> Option<PathBuf> {
        match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_locations().into_iter().find(|p| p.exists()),
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }
}

fn default_locations() -> Vec<PathBuf> {
    let mut locations = vec![PathBuf::from("data/config.yaml")];
    if let Some(dir) = dirs::config_dir() {
        locations.push(dir.join("blueprint").join("config.yaml"));
    }
    locations
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_yaml("").unwrap();
        assert_eq!(config.engine.retry_delay_ms, 500);
        assert_eq!(config.engine.max_ready_attempts, 50);
        assert_eq!(config.engine.command_timeout(), Duration::from_secs(600));
        assert_eq!(config.sandbox.root, "./workspace");
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = "engine:\n  max_ready_attempts: 3\nlogging:\n  file: data/session.log\n";
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.engine.max_ready_attempts, 3);
        assert_eq!(config.engine.retry_delay_ms, 500);
        assert_eq!(config.logging.file.as_deref(), Some("data/session.log"));
    }

    #[test]
    fn test_load_from_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "sandbox:\n  root: /tmp/project\n  boot_delay_ms: 250\n").unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.sandbox.root, "/tmp/project");
        assert_eq!(config.sandbox.boot_delay_ms, 250);
    }

    #[test]
    fn test_load_invalid_yaml_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "engine: [not, a, map]\n").unwrap();

        assert!(AppConfig::load(Some(&path)).is_err());
    }
}
