// Engine Configuration
// Concurrency, timeout and record settings, loadable from YAML or JSON

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How ready nodes are dispatched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// One node at a time
    Serial,
    /// Up to `max_workers` nodes at once; 0 means no limit
    Parallel {
        #[serde(default)]
        max_workers: usize,
    },
    /// Every node goes through the resource manager
    Delegated {
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
    },
}

fn default_poll_interval_ms() -> u64 {
    20
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        ConcurrencyPolicy::Parallel { max_workers: 0 }
    }
}

impl ConcurrencyPolicy {
    /// Maximum number of nodes in flight
    pub fn capacity(&self) -> usize {
        match self {
            ConcurrencyPolicy::Serial => 1,
            ConcurrencyPolicy::Parallel { max_workers: 0 } => usize::MAX,
            ConcurrencyPolicy::Parallel { max_workers } => *max_workers,
            ConcurrencyPolicy::Delegated { .. } => usize::MAX,
        }
    }
}

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub concurrency: ConcurrencyPolicy,
    /// Default dispatch timeout; a template's own timeout wins
    pub node_timeout_secs: Option<u64>,
    /// Reuse stored outputs of nodes whose inputs did not change
    pub resume: bool,
    /// Record store root (default: platform cache dir)
    pub records_dir: Option<PathBuf>,
    pub emit_events: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyPolicy::default(),
            node_timeout_secs: None,
            resume: false,
            records_dir: None,
            emit_events: true,
        }
    }
}

impl EngineConfig {
    pub fn serial() -> Self {
        Self {
            concurrency: ConcurrencyPolicy::Serial,
            ..Default::default()
        }
    }

    pub fn parallel(max_workers: usize) -> Self {
        Self {
            concurrency: ConcurrencyPolicy::Parallel { max_workers },
            ..Default::default()
        }
    }

    pub fn delegated(poll_interval_ms: u64) -> Self {
        Self {
            concurrency: ConcurrencyPolicy::Delegated { poll_interval_ms },
            ..Default::default()
        }
    }

    pub fn with_node_timeout(mut self, secs: u64) -> Self {
        self.node_timeout_secs = Some(secs);
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_records_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.records_dir = Some(dir.into());
        self
    }

    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout_secs.map(Duration::from_secs)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.yml`/`.yaml` or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => Self::from_yaml_str(&content),
            Some("json") => Self::from_json_str(&content),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let ConcurrencyPolicy::Delegated { poll_interval_ms: 0 } = self.concurrency {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.node_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "node_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.concurrency, ConcurrencyPolicy::Parallel { max_workers: 0 });
        assert_eq!(config.concurrency.capacity(), usize::MAX);
        assert!(config.emit_events);
        assert!(!config.resume);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
concurrency:
  mode: parallel
  max_workers: 4
node_timeout_secs: 30
resume: true
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.concurrency.capacity(), 4);
        assert_eq!(config.node_timeout(), Some(Duration::from_secs(30)));
        assert!(config.resume);
        assert!(config.emit_events);
    }

    #[test]
    fn test_from_json_delegated_default_poll() {
        let config =
            EngineConfig::from_json_str(r#"{"concurrency": {"mode": "delegated"}}"#).unwrap();
        assert_eq!(
            config.concurrency,
            ConcurrencyPolicy::Delegated { poll_interval_ms: 20 }
        );
    }

    #[test]
    fn test_invalid_values() {
        let err = EngineConfig::from_yaml_str("node_timeout_secs: 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = EngineConfig::from_yaml_str("concurrency: {mode: warp}").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn test_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("engine.yaml");
        fs::write(&path, "concurrency:\n  mode: serial\n").unwrap();
        assert_eq!(EngineConfig::from_file(&path).unwrap(), EngineConfig::serial());

        let other = temp.path().join("engine.toml");
        fs::write(&other, "").unwrap();
        assert!(matches!(
            EngineConfig::from_file(&other),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }
}
