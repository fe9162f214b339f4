//! Configuration management for formguard.
//!
//! Values are layered with the `config` crate: serde defaults, then an optional
//! file, then `FORMGUARD_`-prefixed environment variables using `__` to reach
//! nested keys (`FORMGUARD_LIMITER__MAX_EVENTS=10`).

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FormGuardError, Result};
use crate::ratelimit::{CountingMode, FailurePolicy};

const ENV_PREFIX: &str = "FORMGUARD";

/// Main configuration for formguard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormGuardConfig {
    /// Sliding window parameters and runtime policies
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Shared backend configuration
    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Sliding window limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Admissions allowed per window
    #[serde(default = "default_max_events")]
    pub max_events: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// What to decide when the shared backend cannot answer
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Whether denied checks consume quota
    #[serde(default)]
    pub counting: CountingMode,

    /// Mutating calls between full sweeps of the local store (0 disables)
    #[serde(default = "default_sweep_every")]
    pub sweep_every: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            window_secs: default_window_secs(),
            failure_policy: FailurePolicy::default(),
            counting: CountingMode::default(),
            sweep_every: default_sweep_every(),
        }
    }
}

impl LimiterConfig {
    /// The window as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

fn default_max_events() -> u64 {
    5
}

fn default_window_secs() -> u64 {
    3600
}

fn default_sweep_every() -> u64 {
    1024
}

/// Remote (Redis) window store configuration.
///
/// Setting `endpoint` selects the remote store at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Redis URL, e.g. `redis://cache.internal:6379/0`
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Password applied on top of the endpoint URL
    #[serde(default)]
    pub credential: Option<String>,

    /// Bound on each round trip in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Bound on the initial connection in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Prefix for every key written to the backend
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Use the local store if the backend is unreachable at startup
    #[serde(default = "default_fallback_to_local")]
    pub fallback_to_local: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            credential: None,
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            key_prefix: default_key_prefix(),
            fallback_to_local: default_fallback_to_local(),
        }
    }
}

impl RemoteConfig {
    /// Whether a shared backend has been configured.
    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_key_prefix() -> String {
    "formguard".to_string()
}

fn default_fallback_to_local() -> bool {
    true
}

impl FormGuardConfig {
    /// Load configuration from an optional file, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path));
        }
        let config: FormGuardConfig = builder
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path, with environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    /// Load configuration from the environment only.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Parse configuration from a YAML document, without environment overrides.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: FormGuardConfig = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.max_events == 0 {
            return Err(FormGuardError::Configuration(
                "limiter.max_events must be greater than zero".to_string(),
            ));
        }
        if self.limiter.window_secs == 0 {
            return Err(FormGuardError::Configuration(
                "limiter.window_secs must be greater than zero".to_string(),
            ));
        }
        if self.remote.timeout_ms == 0 {
            return Err(FormGuardError::Configuration(
                "remote.timeout_ms must be greater than zero".to_string(),
            ));
        }
        match (&self.remote.endpoint, &self.remote.credential) {
            (Some(endpoint), _) if endpoint.trim().is_empty() => Err(
                FormGuardError::Configuration("remote.endpoint must not be empty".to_string()),
            ),
            (None, Some(_)) => Err(FormGuardError::Configuration(
                "remote.credential is set but remote.endpoint is missing".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FormGuardConfig::default();
        assert_eq!(config.limiter.max_events, 5);
        assert_eq!(config.limiter.window(), Duration::from_secs(3600));
        assert_eq!(config.limiter.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(config.limiter.counting, CountingMode::Attempts);
        assert!(!config.remote.is_configured());
        assert_eq!(config.remote.timeout(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
limiter:
  max_events: 3
  window_secs: 10
  failure_policy: fail-closed
  counting: admissions
remote:
  endpoint: redis://127.0.0.1:6379
  credential: s3cret
  timeout_ms: 250
"#;
        let config = FormGuardConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.limiter.max_events, 3);
        assert_eq!(config.limiter.window(), Duration::from_secs(10));
        assert_eq!(config.limiter.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.limiter.counting, CountingMode::Admissions);
        assert_eq!(config.limiter.sweep_every, 1024);
        assert_eq!(config.remote.endpoint.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.remote.credential.as_deref(), Some("s3cret"));
        assert_eq!(config.remote.timeout(), Duration::from_millis(250));
        assert_eq!(config.remote.key_prefix, "formguard");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = FormGuardConfig::from_yaml_str("limiter:\n  max_events: 9\n").unwrap();
        assert_eq!(config.limiter.max_events, 9);
        assert_eq!(config.limiter.window_secs, 3600);
        assert!(config.remote.fallback_to_local);
    }

    #[test]
    fn test_zero_max_events_rejected() {
        let result = FormGuardConfig::from_yaml_str("limiter:\n  max_events: 0\n");
        assert!(matches!(result, Err(FormGuardError::Configuration(_))));
    }

    #[test]
    fn test_zero_window_rejected() {
        let result = FormGuardConfig::from_yaml_str("limiter:\n  window_secs: 0\n");
        assert!(matches!(result, Err(FormGuardError::Configuration(_))));
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let result = FormGuardConfig::from_yaml_str("limiter:\n  failure_policy: maybe\n");
        assert!(matches!(result, Err(FormGuardError::Configuration(_))));
    }

    #[test]
    fn test_credential_without_endpoint_rejected() {
        let mut config = FormGuardConfig::default();
        config.remote.credential = Some("token".to_string());
        assert!(matches!(config.validate(), Err(FormGuardError::Configuration(_))));
    }

    #[test]
    fn test_blank_endpoint_rejected() {
        let mut config = FormGuardConfig::default();
        config.remote.endpoint = Some("  ".to_string());
        assert!(matches!(config.validate(), Err(FormGuardError::Configuration(_))));
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let result = FormGuardConfig::from_file("/nonexistent/formguard.yaml");
        assert!(matches!(result, Err(FormGuardError::Configuration(_))));
    }
}
