//! Operator configuration
//!
//! Loaded from a YAML file; every field has a default so an empty file (or
//! no file) yields a working configuration. The operator identity written
//! into lock annotations falls back to the pod name from the environment.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, FABRIK_NAMESPACE};

/// Top-level operator configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct FabrikConfig {
    /// Namespace holding Fabrik resources
    pub namespace: Option<String>,
    /// Identity recorded as lock owner (defaults to the pod name)
    pub identity: Option<String>,
    /// Poller and watch timing
    pub pollers: PollerSettings,
    /// Lock timeouts
    pub locks: LockSettings,
    /// Director admission control
    pub rate_limit: RateLimitSettings,
}

/// Poller and watch timing, in milliseconds
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PollerSettings {
    /// Interval between director task status polls
    pub task_poll_interval_ms: u64,
    /// Interval between stale-lock reaper polls
    pub unlock_poll_interval_ms: u64,
    /// Grace added to a poller claim before another process may take it over
    pub relaxation_ms: u64,
    /// How long a watch stream is consumed before it is re-registered
    pub watch_refresh_interval_ms: u64,
    /// Delay before retrying a failed watch registration
    pub watcher_error_delay_ms: u64,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            task_poll_interval_ms: 50_000,
            unlock_poll_interval_ms: 3_000,
            relaxation_ms: 5_000,
            watch_refresh_interval_ms: 60_000,
            watcher_error_delay_ms: 30_000,
        }
    }
}

impl PollerSettings {
    /// Task poll interval
    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_millis(self.task_poll_interval_ms)
    }

    /// Stale-lock reaper poll interval
    pub fn unlock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.unlock_poll_interval_ms)
    }

    /// Poller claim relaxation
    pub fn relaxation(&self) -> Duration {
        Duration::from_millis(self.relaxation_ms)
    }

    /// Watch refresh interval
    pub fn watch_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.watch_refresh_interval_ms)
    }

    /// Watch registration retry delay
    pub fn watcher_error_delay(&self) -> Duration {
        Duration::from_millis(self.watcher_error_delay_ms)
    }
}

/// Lock timeouts
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LockSettings {
    /// How long an operator's processing lock is honored (seconds)
    pub processing_timeout_secs: u64,
    /// Deployment lock TTL when no per-operation value is configured (seconds)
    pub default_ttl_secs: u64,
    /// Deployment lock TTL per locked operation, e.g. `backup: 86400` (seconds)
    pub ttl_secs: BTreeMap<String, u64>,
    /// Unlock deployment locks that outlived their TTL instead of only
    /// dropping them from local polling
    pub force_unlock_expired: bool,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            processing_timeout_secs: 300,
            default_ttl_secs: 86_400,
            ttl_secs: BTreeMap::new(),
            force_unlock_expired: false,
        }
    }
}

impl LockSettings {
    /// Processing lock timeout
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    /// TTL of a deployment lock held for `operation`
    pub fn ttl_for(&self, operation: &str) -> Duration {
        Duration::from_secs(
            self.ttl_secs
                .get(operation)
                .copied()
                .unwrap_or(self.default_ttl_secs),
        )
    }
}

/// Director admission control
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RateLimitSettings {
    /// Gate deployments on director capacity
    pub enabled: bool,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl FabrikConfig {
    /// Parse configuration from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| Error::config(format!("invalid config: {e}")))
    }

    /// Load configuration from a file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&data)
    }

    /// Namespace holding Fabrik resources
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(FABRIK_NAMESPACE)
    }

    /// Lock owner identity: configured value, else pod name, else host name
    pub fn resolve_identity(&self, env: &dyn EnvConfig) -> Result<String> {
        self.identity
            .clone()
            .or_else(|| env.pod_name())
            .or_else(|| env.host_name())
            .ok_or_else(|| {
                Error::config("no identity configured and neither POD_NAME nor HOSTNAME is set")
            })
    }
}

/// Trait for reading identity-related environment configuration
///
/// Abstracts environment variables so tests do not touch global state.
#[cfg_attr(test, mockall::automock)]
pub trait EnvConfig: Send + Sync {
    /// Pod name (downward API)
    fn pod_name(&self) -> Option<String>;

    /// Host name
    fn host_name(&self) -> Option<String>;
}

/// Default implementation that reads from environment variables
#[derive(Clone, Default)]
pub struct OsEnvConfig;

impl EnvConfig for OsEnvConfig {
    fn pod_name(&self) -> Option<String> {
        std::env::var("POD_NAME").ok().filter(|v| !v.is_empty())
    }

    fn host_name(&self) -> Option<String> {
        std::env::var("HOSTNAME").ok().filter(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_yields_defaults() {
        let config = FabrikConfig::from_yaml("").unwrap();
        assert_eq!(config, FabrikConfig::default());
        assert_eq!(config.namespace(), "default");
        assert_eq!(config.pollers.unlock_poll_interval(), Duration::from_secs(3));
        assert_eq!(config.locks.processing_timeout(), Duration::from_secs(300));
        assert!(config.rate_limit.enabled);
        assert!(!config.locks.force_unlock_expired);
    }

    #[test]
    fn partial_yaml_overrides_only_given_fields() {
        let config = FabrikConfig::from_yaml(
            r#"
namespace: fabrik
pollers:
  unlock_poll_interval_ms: 500
locks:
  ttl_secs:
    backup: 3600
rate_limit:
  enabled: false
"#,
        )
        .unwrap();

        assert_eq!(config.namespace(), "fabrik");
        assert_eq!(config.pollers.unlock_poll_interval(), Duration::from_millis(500));
        assert_eq!(config.pollers.relaxation(), Duration::from_secs(5));
        assert_eq!(config.locks.ttl_for("backup"), Duration::from_secs(3600));
        assert_eq!(config.locks.ttl_for("restore"), Duration::from_secs(86_400));
        assert!(!config.rate_limit.enabled);
    }

    #[test]
    fn invalid_yaml_is_a_config_error() {
        let err = FabrikConfig::from_yaml("pollers: [not, a, map]").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn identity_prefers_configured_value() {
        let mut env = MockEnvConfig::new();
        env.expect_pod_name().never();
        env.expect_host_name().never();

        let config = FabrikConfig {
            identity: Some("broker-a".to_string()),
            ..Default::default()
        };
        assert_eq!(config.resolve_identity(&env).unwrap(), "broker-a");
    }

    #[test]
    fn identity_falls_back_to_pod_then_host() {
        let mut env = MockEnvConfig::new();
        env.expect_pod_name()
            .returning(|| Some("fabrik-operator-6d9f".to_string()));
        env.expect_host_name().never();
        assert_eq!(
            FabrikConfig::default().resolve_identity(&env).unwrap(),
            "fabrik-operator-6d9f"
        );

        let mut env = MockEnvConfig::new();
        env.expect_pod_name().returning(|| None);
        env.expect_host_name().returning(|| Some("vm-12".to_string()));
        assert_eq!(FabrikConfig::default().resolve_identity(&env).unwrap(), "vm-12");
    }

    #[test]
    fn identity_missing_everywhere_is_an_error() {
        let mut env = MockEnvConfig::new();
        env.expect_pod_name().returning(|| None);
        env.expect_host_name().returning(|| None);
        assert!(FabrikConfig::default().resolve_identity(&env).is_err());
    }
}
