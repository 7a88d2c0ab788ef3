//! Scheduler configuration.

use cadence_trace::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid scheduler configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Drain refuses to create instances below this much free disk space.
    #[serde(default = "default_min_free_disk_mb")]
    pub min_free_disk_mb: u64,
    /// Approver recorded on automatically triggered stages.
    #[serde(default = "default_approver")]
    pub default_approver: String,
    /// Schedule a completed stage in newer instances that are waiting on it.
    #[serde(default = "default_trigger_newer")]
    pub trigger_newer_on_completion: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_min_free_disk_mb() -> u64 {
    1024
}

fn default_approver() -> String {
    "changes".to_string()
}

fn default_trigger_newer() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_free_disk_mb: default_min_free_disk_mb(),
            default_approver: default_approver(),
            trigger_newer_on_completion: default_trigger_newer(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn with_min_free_disk_mb(mut self, mb: u64) -> Self {
        self.min_free_disk_mb = mb;
        self
    }

    pub fn with_default_approver(mut self, approver: impl Into<String>) -> Self {
        self.default_approver = approver.into();
        self
    }

    pub fn with_trigger_newer_on_completion(mut self, enabled: bool) -> Self {
        self.trigger_newer_on_completion = enabled;
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_trace::LogFormat;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.min_free_disk_mb, 1024);
        assert_eq!(config.default_approver, "changes");
        assert!(config.trigger_newer_on_completion);
    }

    #[test]
    fn test_partial_yaml() {
        let config: SchedulerConfig = serde_yaml::from_str(
            "min_free_disk_mb: 10\nlogging:\n  level: debug\n  format: json\n",
        )
        .unwrap();
        assert_eq!(config.min_free_disk_mb, 10);
        assert_eq!(config.default_approver, "changes");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_missing_file() {
        let err = SchedulerConfig::from_file(Path::new("/nonexistent/cadence.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
