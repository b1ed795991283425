//! Cluster specification: the single source of desired truth.

use crate::core::errors::{ConvoyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Prefix for options that become environment variables of launched processes
pub const ENV_PREFIX: &str = "env.";
/// Role option holding extra launch arguments
pub const OPTION_APP_ARGS: &str = "appArgs";
/// Role option overriding the heap tunable
pub const OPTION_JVM_HEAP: &str = "jvmHeap";
/// Delay (ms) between a lifecycle process succeeding and the review notification
pub const OPTION_CONTAINER_STARTUP_DELAY: &str = "containerStartupDelay";
/// Per-cluster override of the failure threshold
pub const OPTION_MAX_PROCESS_FAILURES: &str = "maxProcessFailures";
/// Per-cluster override of the failure window (ms)
pub const OPTION_FAILURE_WINDOW: &str = "failureWindow";
/// Per-cluster override of the failed instances a role may accumulate
/// inside the failure window before it stops being replaced
pub const OPTION_MAX_ROLE_FAILURES: &str = "maxRoleFailures";

/// Desired shape of one role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleSpec {
    /// Desired number of instances
    pub instances: u32,
    #[serde(default)]
    pub min_instances: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_instances: Option<u32>,
    /// Heap size tunable, e.g. "256m"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jvm_heap: Option<String>,
    /// Per-role option overrides
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl RoleSpec {
    pub fn new(instances: u32) -> Self {
        Self {
            instances,
            ..Default::default()
        }
    }

    pub fn with_bounds(mut self, min: u32, max: Option<u32>) -> Self {
        self.min_instances = min;
        self.max_instances = max;
        self
    }

    pub fn with_heap(mut self, heap: impl Into<String>) -> Self {
        self.jvm_heap = Some(heap.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    fn validate(&self, role: &str) -> Result<()> {
        if self.min_instances > self.instances {
            return Err(ConvoyError::configuration(format!(
                "role '{}': {} instances requested but minimum is {}",
                role, self.instances, self.min_instances
            )));
        }
        if let Some(max) = self.max_instances {
            if self.min_instances > max {
                return Err(ConvoyError::configuration(format!(
                    "role '{}': minInstances {} exceeds maxInstances {}",
                    role, self.min_instances, max
                )));
            }
            if self.instances > max {
                return Err(ConvoyError::configuration(format!(
                    "role '{}': {} instances requested but maximum is {}",
                    role, self.instances, max
                )));
            }
        }
        Ok(())
    }
}

/// Cluster specification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub name: String,
    /// Hosted application type, selects the provider
    pub application: String,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleSpec>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
}

impl ClusterSpec {
    pub fn new(name: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            application: application.into(),
            roles: BTreeMap::new(),
            options: BTreeMap::new(),
            data_path: None,
            image_path: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>, spec: RoleSpec) -> Self {
        self.roles.insert(role.into(), spec);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_data_path(mut self, path: impl Into<String>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    pub fn with_image_path(mut self, path: impl Into<String>) -> Self {
        self.image_path = Some(path.into());
        self
    }

    /// Structural invariants independent of any provider
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ConvoyError::configuration("cluster name must not be empty"));
        }
        if self.application.trim().is_empty() {
            return Err(ConvoyError::configuration("application type must not be empty"));
        }
        for (role, spec) in &self.roles {
            spec.validate(role)?;
        }
        Ok(())
    }

    pub fn get_option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn get_option_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get_option(key).unwrap_or(default)
    }

    /// Fetch an option that must be present; absence is a configuration error
    pub fn get_mandatory_option(&self, key: &str) -> Result<&str> {
        match self.options.get(key) {
            Some(value) if !value.trim().is_empty() => Ok(value.as_str()),
            _ => Err(ConvoyError::missing_option(key)),
        }
    }

    /// Integer option with a default; a non-numeric value is a configuration error
    pub fn get_option_u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.options.get(key) {
            None => Ok(default),
            Some(value) => value.trim().parse::<u64>().map_err(|_| ConvoyError::Configuration {
                message: format!("option '{}' must be an integer, got '{}'", key, value),
                key: Some(key.to_string()),
            }),
        }
    }

    /// Role option, falling back to a global option of the same name
    pub fn get_role_option(&self, role: &str, key: &str) -> Option<&str> {
        self.roles
            .get(role)
            .and_then(|r| r.options.get(key))
            .or_else(|| self.options.get(key))
            .map(String::as_str)
    }

    pub fn desired_instances(&self, role: &str) -> u32 {
        self.roles.get(role).map(|r| r.instances).unwrap_or(0)
    }

    pub fn total_desired(&self) -> u32 {
        self.roles.values().map(|r| r.instances).sum()
    }

    pub fn is_image_path_set(&self) -> bool {
        self.image_path.as_deref().map(|p| !p.trim().is_empty()).unwrap_or(false)
    }

    /// Environment entries from `env.*` options
    pub fn global_env(&self) -> BTreeMap<String, String> {
        env_entries(&self.options)
    }

    /// Environment entries from a role's `env.*` options
    pub fn role_env(&self, role: &str) -> BTreeMap<String, String> {
        self.roles
            .get(role)
            .map(|r| env_entries(&r.options))
            .unwrap_or_default()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

fn env_entries(options: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    options
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(ENV_PREFIX)
                .filter(|name| !name.is_empty())
                .map(|name| (name.to_string(), v.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> ClusterSpec {
        ClusterSpec::new("c1", "accumulo")
            .with_role("master", RoleSpec::new(1))
            .with_role("worker", RoleSpec::new(3).with_option("env.TSERVER_PORT", "9997"))
            .with_option("zkHome", "/zk")
            .with_option("env.JAVA_HOME", "/jdk")
    }

    #[test]
    fn test_mandatory_option() {
        let spec = sample();
        assert_eq!(spec.get_mandatory_option("zkHome").unwrap(), "/zk");
        let err = spec.get_mandatory_option("accumuloPassword").unwrap_err();
        assert_eq!(err.missing_key(), Some("accumuloPassword"));
    }

    #[test]
    fn test_blank_mandatory_option_is_missing() {
        let spec = sample().with_option("accumuloPassword", "  ");
        assert!(spec.get_mandatory_option("accumuloPassword").is_err());
    }

    #[test]
    fn test_counts_validation() {
        assert!(sample().validate().is_ok());

        let bad = sample().with_role("monitor", RoleSpec::new(1).with_bounds(2, None));
        assert!(bad.validate().is_err());

        let bad = sample().with_role("monitor", RoleSpec::new(3).with_bounds(0, Some(2)));
        assert!(bad.validate().is_err());

        let bad = sample().with_role("monitor", RoleSpec::new(1).with_bounds(3, Some(2)));
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_env_layers() {
        let spec = sample();
        assert_eq!(spec.global_env().get("JAVA_HOME").map(String::as_str), Some("/jdk"));
        assert_eq!(spec.role_env("worker").get("TSERVER_PORT").map(String::as_str), Some("9997"));
        assert!(spec.role_env("master").is_empty());
    }

    #[test]
    fn test_json_roundtrip_uses_camel_case() {
        let spec = sample().with_data_path("/data/c1");
        let json = spec.to_json().unwrap();
        assert!(json.contains("\"dataPath\""));
        assert_eq!(ClusterSpec::from_json(&json).unwrap(), spec);
    }

    #[test]
    fn test_yaml_input() {
        let spec = ClusterSpec::from_yaml(
            "name: c2\napplication: accumulo\nroles:\n  master:\n    instances: 1\noptions:\n  zkHome: /zk\n",
        )
        .unwrap();
        assert_eq!(spec.desired_instances("master"), 1);
        assert_eq!(spec.get_option("zkHome"), Some("/zk"));
    }

    #[test]
    fn test_bad_integer_option() {
        let spec = sample().with_option("containerStartupDelay", "soon");
        let err = spec.get_option_u64("containerStartupDelay", 10).unwrap_err();
        assert_eq!(err.missing_key(), Some("containerStartupDelay"));
        assert_eq!(sample().get_option_u64("containerStartupDelay", 10).unwrap(), 10);
    }
}
