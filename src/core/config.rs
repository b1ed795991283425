use crate::core::errors::{ConvoyError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Master configuration with all tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    // Control surface
    /// Principals allowed to call the control protocol. `*` allows everyone.
    pub acl: Vec<String>,

    // Reconciliation
    /// Periodic cluster review interval (ms)
    pub review_interval_ms: u64,
    /// Probe polling interval for running instances (ms)
    pub probe_interval_ms: u64,
    /// Probe timeout (ms)
    pub probe_timeout_ms: u64,
    /// Capacity of the engine command/event channels
    pub channel_capacity: usize,

    // Coordination service
    /// Bounded wait for the coordination liveness check (ms)
    pub coordination_timeout_ms: u64,

    // Process supervision
    /// Unexpected exits tolerated inside the window before a child is fatal
    pub max_process_failures: u32,
    /// Failure counting window (ms), for processes and roles alike
    pub failure_window_ms: u64,
    /// Failed instances per role inside the window before the role is
    /// halted instead of replaced (0 = never halt)
    pub max_role_failures: u32,
    /// Delay before a notification step fires after its predecessor (ms)
    pub container_startup_delay_ms: u64,

    // Local resources
    /// Root for per-slot working and log directories
    pub work_dir: PathBuf,
    /// Maximum slots the local resource manager hands out (0 = unlimited)
    pub max_slots: usize,

    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            acl: vec!["*".to_string()],

            review_interval_ms: 30_000,
            probe_interval_ms: 10_000,
            probe_timeout_ms: 2_000,
            channel_capacity: 1_024,

            coordination_timeout_ms: 5_000,

            max_process_failures: 3,
            failure_window_ms: 60_000,
            max_role_failures: 5,
            container_startup_delay_ms: 5_000,

            work_dir: std::env::temp_dir().join("convoy"),
            max_slots: 0,

            logging: LoggingConfig::default(),
        }
    }
}

impl MasterConfig {
    /// Create a new builder for MasterConfig
    pub fn builder() -> MasterConfigBuilder {
        MasterConfigBuilder::new()
    }

    /// Load from a YAML or JSON file, chosen by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConvoyError::io(format!("read config {}", path.display()), e))?;
        let config: MasterConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            _ => serde_yaml::from_str(&text)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply `CONVOY_*` environment overrides on top of this configuration
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(acl) = std::env::var("CONVOY_ACL") {
            self.acl = parse_principals(&acl);
        }
        if let Ok(v) = std::env::var("CONVOY_COORDINATION_TIMEOUT_MS") {
            self.coordination_timeout_ms = parse_env("CONVOY_COORDINATION_TIMEOUT_MS", &v)?;
        }
        if let Ok(v) = std::env::var("CONVOY_REVIEW_INTERVAL_MS") {
            self.review_interval_ms = parse_env("CONVOY_REVIEW_INTERVAL_MS", &v)?;
        }
        if let Ok(v) = std::env::var("CONVOY_WORK_DIR") {
            self.work_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CONVOY_LOG_LEVEL") {
            self.logging.level = v;
        }
        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.acl.is_empty() {
            return Err(ConvoyError::configuration("acl must name at least one principal"));
        }
        if self.review_interval_ms == 0 {
            return Err(ConvoyError::configuration("review_interval_ms must be greater than 0"));
        }
        if self.probe_interval_ms == 0 {
            return Err(ConvoyError::configuration("probe_interval_ms must be greater than 0"));
        }
        if self.channel_capacity == 0 {
            return Err(ConvoyError::configuration("channel_capacity must be greater than 0"));
        }
        if self.coordination_timeout_ms == 0 {
            return Err(ConvoyError::configuration("coordination_timeout_ms must be greater than 0"));
        }
        if self.max_process_failures == 0 {
            return Err(ConvoyError::configuration("max_process_failures must be at least 1"));
        }
        Ok(())
    }

    pub fn review_interval(&self) -> Duration {
        Duration::from_millis(self.review_interval_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn coordination_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination_timeout_ms)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    pub fn container_startup_delay(&self) -> Duration {
        Duration::from_millis(self.container_startup_delay_ms)
    }

    /// Configuration tuned for tests and local runs
    pub fn development() -> Self {
        Self {
            review_interval_ms: 200,
            probe_interval_ms: 200,
            probe_timeout_ms: 500,
            coordination_timeout_ms: 1_000,
            failure_window_ms: 5_000,
            container_startup_delay_ms: 50,
            ..Default::default()
        }
    }
}

fn parse_env(name: &str, value: &str) -> Result<u64> {
    value.trim().parse::<u64>().map_err(|_| {
        ConvoyError::Configuration {
            message: format!("{} must be an integer, got '{}'", name, value),
            key: Some(name.to_string()),
        }
    })
}

/// Split a comma/whitespace separated principal list
pub fn parse_principals(list: &str) -> Vec<String> {
    list.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Builder for MasterConfig
pub struct MasterConfigBuilder {
    config: MasterConfig,
}

impl MasterConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: MasterConfig::default(),
        }
    }

    /// Set the allowed principals
    pub fn acl<I, S>(mut self, principals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.acl = principals.into_iter().map(Into::into).collect();
        self
    }

    pub fn review_interval(mut self, interval: Duration) -> Self {
        self.config.review_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.config.probe_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn coordination_timeout(mut self, timeout: Duration) -> Self {
        self.config.coordination_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set failure escalation: threshold and counting window
    pub fn failures(mut self, max: u32, window: Duration) -> Self {
        self.config.max_process_failures = max;
        self.config.failure_window_ms = window.as_millis() as u64;
        self
    }

    /// Failed instances a role may accumulate before it is halted
    pub fn max_role_failures(mut self, max: u32) -> Self {
        self.config.max_role_failures = max;
        self
    }

    pub fn container_startup_delay(mut self, delay: Duration) -> Self {
        self.config.container_startup_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = dir.into();
        self
    }

    pub fn max_slots(mut self, slots: usize) -> Self {
        self.config.max_slots = slots;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<MasterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for MasterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MasterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.coordination_timeout(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_development_config() {
        let config = MasterConfig::development();
        assert!(config.validate().is_ok());
        assert!(config.review_interval() < Duration::from_secs(1));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = MasterConfig::default();

        config.acl.clear();
        assert!(config.validate().is_err());
        config.acl = vec!["ops".into()];

        config.max_process_failures = 0;
        assert!(config.validate().is_err());
        config.max_process_failures = 2;

        config.coordination_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = MasterConfig::builder()
            .acl(["alice", "bob"])
            .coordination_timeout(Duration::from_millis(250))
            .failures(5, Duration::from_secs(10))
            .max_slots(8)
            .max_role_failures(2)
            .build()
            .unwrap();

        assert_eq!(config.acl, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(config.coordination_timeout_ms, 250);
        assert_eq!(config.max_process_failures, 5);
        assert_eq!(config.max_slots, 8);
        assert_eq!(config.max_role_failures, 2);
    }

    #[test]
    fn test_yaml_partial_uses_defaults() {
        let config: MasterConfig = serde_yaml::from_str("acl: [ops]\nmax_slots: 4\n").unwrap();
        assert_eq!(config.acl, vec!["ops".to_string()]);
        assert_eq!(config.max_slots, 4);
        assert_eq!(config.review_interval_ms, 30_000);
        assert_eq!(config.max_role_failures, 5);
    }

    #[test]
    fn test_parse_principals() {
        assert_eq!(parse_principals("alice, bob  carol"), vec!["alice", "bob", "carol"]);
        assert!(parse_principals(" , ").is_empty());
    }
}
