//! Orchestrator configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file is valid.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "STAGEHAND_CONFIG";

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read {path}: {source}")]
    Io {
        /// Path tried
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Directory under which per-invocation secret scopes are created
    pub secret_mount_root: PathBuf,
    /// Execution timeout for capabilities that declare none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_timeout_secs: Option<u64>,
    /// Default upper bound on the blue/green drain wait
    pub drain_timeout_secs: u64,
    /// Default interval between drain polls
    pub drain_poll_interval_secs: u64,
    /// Default rollout analysis window
    pub analysis_window_secs: u64,
    /// Keep the substrate record of single-capability runs once they finish
    pub retain_single_step_runs: bool,
    /// Per-capability configuration, validated against each config schema
    pub capabilities: BTreeMap<String, Value>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            secret_mount_root: std::env::temp_dir().join("stagehand-secrets"),
            execution_timeout_secs: None,
            drain_timeout_secs: 600,
            drain_poll_interval_secs: 15,
            analysis_window_secs: 300,
            retain_single_step_runs: false,
            capabilities: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With secret mount root
    #[inline]
    #[must_use]
    pub fn with_secret_mount_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.secret_mount_root = root.into();
        self
    }

    /// With default execution timeout
    #[inline]
    #[must_use]
    pub fn with_execution_timeout(mut self, secs: u64) -> Self {
        self.execution_timeout_secs = Some(secs);
        self
    }

    /// With default drain bounds
    #[inline]
    #[must_use]
    pub fn with_drain(mut self, timeout_secs: u64, poll_interval_secs: u64) -> Self {
        self.drain_timeout_secs = timeout_secs;
        self.drain_poll_interval_secs = poll_interval_secs;
        self
    }

    /// With default analysis window
    #[inline]
    #[must_use]
    pub fn with_analysis_window(mut self, secs: u64) -> Self {
        self.analysis_window_secs = secs;
        self
    }

    /// Keep or retire finished single-capability runs
    #[inline]
    #[must_use]
    pub fn with_single_step_retention(mut self, retain: bool) -> Self {
        self.retain_single_step_runs = retain;
        self
    }

    /// With configuration for one capability
    #[must_use]
    pub fn with_capability_config(mut self, cap_id: impl Into<String>, config: Value) -> Self {
        self.capabilities.insert(cap_id.into(), config);
        self
    }

    /// Configuration for `cap_id` (`{}` when absent)
    #[must_use]
    pub fn capability_config(&self, cap_id: &str) -> Value {
        self.capabilities
            .get(cap_id)
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
    }

    /// Default execution timeout as a duration
    #[inline]
    #[must_use]
    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_secs.map(Duration::from_secs)
    }

    /// Parse from TOML text
    ///
    /// # Errors
    /// Malformed TOML or out-of-range values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// Unreadable file, malformed TOML or out-of-range values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML
    ///
    /// # Errors
    /// Values TOML cannot represent (e.g. `null` in capability config).
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Check ranges
    ///
    /// # Errors
    /// Zero poll interval, zero execution timeout or a non-object
    /// capability config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.drain_poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "drain_poll_interval_secs must be positive".into(),
            ));
        }
        if self.execution_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "execution_timeout_secs must be positive".into(),
            ));
        }
        if let Some((cap_id, _)) = self.capabilities.iter().find(|(_, v)| !v.is_object()) {
            return Err(ConfigError::Invalid(format!(
                "capabilities.{cap_id} must be a table"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_toml_is_default() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.drain_timeout_secs, 600);
    }

    #[test]
    fn parses_capability_tables() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            drain_timeout_secs = 120
            execution_timeout_secs = 30

            [capabilities."k8s.apply_manifests"]
            cluster = "eu-west-1"
            "#,
        )
        .unwrap();
        assert_eq!(config.drain_timeout_secs, 120);
        assert_eq!(config.execution_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(
            config.capability_config("k8s.apply_manifests"),
            json!({ "cluster": "eu-west-1" })
        );
        assert_eq!(config.capability_config("flags.sync"), json!({}));
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let err = OrchestratorConfig::from_toml_str("drain_poll_interval_secs = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_execution_timeout() {
        let err = OrchestratorConfig::from_toml_str("execution_timeout_secs = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(message) if message.contains("execution_timeout_secs")));
        assert!(OrchestratorConfig::new().with_execution_timeout(0).validate().is_err());
    }

    #[test]
    fn single_step_runs_are_retired_by_default() {
        assert!(!OrchestratorConfig::default().retain_single_step_runs);
        let config = OrchestratorConfig::from_toml_str("retain_single_step_runs = true").unwrap();
        assert!(config.retain_single_step_runs);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stagehand.toml");
        std::fs::write(&path, "analysis_window_secs = 60\n").unwrap();
        let config = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(config.analysis_window_secs, 60);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = OrchestratorConfig::new()
            .with_drain(30, 5)
            .with_capability_config("flags.sync", json!({ "project": "shop" }));
        let text = config.to_toml_string().unwrap();
        assert_eq!(OrchestratorConfig::from_toml_str(&text).unwrap(), config);
    }
}
