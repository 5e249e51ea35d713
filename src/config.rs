use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_ENV: &str = "USERSCRIPT_BRIDGE_CONFIG";

const DEFAULT_SUPPRESSED_GLOBALS: &[&str] = &["chrome", "browser"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read bridge config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// How `idle` scripts wait out one macrotask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleDefer {
    /// `SetTimeout` round trip through the counterpart realm.
    #[default]
    RoundTrip,
    /// Zero-length sleep on the local tokio timer.
    LocalTimer,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub idle_defer: IdleDefer,
    /// Ambient globals nulled out in CONTENT mode.
    pub suppressed_globals: Vec<String>,
    /// Reported as `scriptHandler` to userscripts.
    pub handler_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            idle_defer: IdleDefer::default(),
            suppressed_globals: DEFAULT_SUPPRESSED_GLOBALS
                .iter()
                .map(|name| name.to_string())
                .collect(),
            handler_name: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

impl BridgeConfig {
    /// Load from `config_path`, falling back to defaults when the file does
    /// not exist.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        match config_path {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `$USERSCRIPT_BRIDGE_CONFIG`, else `bridge.yaml` in the platform config
    /// directory.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .or_else(default_config_path);
        Self::load(path)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&contents)?)
    }
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "userscript", "userscript-bridge")
        .map(|dirs| dirs.config_dir().join("bridge.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_default() {
        let config = BridgeConfig::load(None).unwrap();
        assert_eq!(config.idle_defer, IdleDefer::RoundTrip);
        assert_eq!(config.suppressed_globals, vec!["chrome", "browser"]);
    }

    #[test]
    fn missing_file_is_default() {
        let config = BridgeConfig::load(Some(PathBuf::from("/nonexistent/bridge.yaml"))).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn loads_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "idle_defer: local_timer\nsuppressed_globals:\n  - chrome\nhandler_name: demo"
        )
        .unwrap();
        let config = BridgeConfig::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.idle_defer, IdleDefer::LocalTimer);
        assert_eq!(config.suppressed_globals, vec!["chrome"]);
        assert_eq!(config.handler_name, "demo");
    }

    #[test]
    fn rejects_unknown_defer_mode() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "idle_defer: never").unwrap();
        assert!(matches!(
            BridgeConfig::load(Some(file.path().to_path_buf())),
            Err(ConfigError::Yaml(_))
        ));
    }
}
