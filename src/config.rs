//! Configuration Management
//!
//! Audit settings loaded from a YAML or JSON file (chosen by extension),
//! then overridden from the command line. The resolved [`AuditConfig`] is
//! handed to the pipeline explicitly.

use crate::audit::checkpoint::CheckpointManager;
use crate::graph::RetryPolicy;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_API_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Audit run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub api_base_url: String,
    /// Resources expanded concurrently
    pub max_parallel: usize,
    pub memory_ceiling_mb: Option<u64>,
    /// Completed resources between memory checks
    pub memory_check_interval: usize,
    pub retry: RetryPolicy,
    /// Per-call timeout
    pub call_timeout_secs: u64,
    pub resume: bool,
    pub checkpoint_path: Option<PathBuf>,
    /// Glob patterns matched against resource names and URLs
    pub exclusions: Vec<String>,
    pub include_personal: bool,
    /// Largest files/folders reported per resource; 0 disables the drive walk
    pub largest_items: usize,
    pub top_n: usize,
    pub progress_interval: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE.to_string(),
            max_parallel: 8,
            memory_ceiling_mb: None,
            memory_check_interval: 50,
            retry: RetryPolicy::default(),
            call_timeout_secs: 30,
            resume: false,
            checkpoint_path: None,
            exclusions: Vec::new(),
            include_personal: false,
            largest_items: 0,
            top_n: 10,
            progress_interval: 25,
        }
    }
}

impl AuditConfig {
    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("siteaudit").join("config.yaml"))
    }

    /// Load configuration. An explicit path must exist; the default path is
    /// optional and falls back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Parse a config file, YAML or JSON by extension
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        let config: Self = match ext.as_deref() {
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON config {}", path.display()))?,
            _ => serde_yaml::from_str(&content)
                .with_context(|| format!("Invalid YAML config {}", path.display()))?,
        };

        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            bail!("max_parallel must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.call_timeout_secs == 0 {
            bail!("call_timeout_secs must be at least 1");
        }
        url::Url::parse(&self.api_base_url)
            .with_context(|| format!("Invalid api_base_url: {}", self.api_base_url))?;
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn memory_ceiling_bytes(&self) -> Option<u64> {
        self.memory_ceiling_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }

    /// Configured checkpoint path, else the default data location
    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_path
            .clone()
            .or_else(CheckpointManager::default_path)
            .unwrap_or_else(|| PathBuf::from("siteaudit-checkpoint.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AuditConfig::default();
        assert_eq!(config.max_parallel, 8);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(!config.include_personal);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_with_partial_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "max_parallel: 4\nexclusions:\n  - \"archive*\"\nretry:\n  max_attempts: 3\n",
        )
        .unwrap();

        let config = AuditConfig::load(Some(&path)).unwrap();
        assert_eq!(config.max_parallel, 4);
        assert_eq!(config.exclusions, vec!["archive*"]);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.top_n, 10);
    }

    #[test]
    fn test_json_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"resume": true, "memory_ceiling_mb": 2}"#).unwrap();

        let config = AuditConfig::load(Some(&path)).unwrap();
        assert!(config.resume);
        assert_eq!(config.memory_ceiling_bytes(), Some(2 * 1024 * 1024));
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AuditConfig::load(Some(&dir.path().join("nope.yaml"))).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_parallelism() {
        let config = AuditConfig {
            max_parallel: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
