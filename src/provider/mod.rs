//! Provider capability contract
//!
//! A provider encapsulates everything specific to one hosted-application
//! type: which roles exist, which options are mandatory, how a container is
//! launched, what has to run once before steady state and how published
//! endpoints are discovered. The engine only talks to `dyn Provider`.

pub mod accumulo;
pub mod probe;

pub use accumulo::AccumuloProvider;
pub use probe::{run_probe, Probe, ProbeReport, ProbeTarget, TcpPortProbe};

use crate::coordination::{zookeeper_factory, CoordinationFactory};
use crate::core::config::MasterConfig;
use crate::core::errors::{ConvoyError, Result};
use crate::exec::{ExecutionContext, LifecycleSequencer, Notification, SequenceHandle};
use crate::spec::{ClusterSpec, Slot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A role this application type knows how to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRole {
    pub name: String,
    /// Smallest acceptable desired count
    pub min_instances: u32,
}

impl ProviderRole {
    pub fn new(name: impl Into<String>, min_instances: u32) -> Self {
        Self {
            name: name.into(),
            min_instances,
        }
    }
}

/// One-off actions that must complete before steady-state service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Initialize,
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialize => f.write_str("initialize"),
        }
    }
}

/// Environment a lifecycle action runs in. Borrowed for one call only.
#[derive(Clone)]
pub struct ActionContext {
    pub sequencer: LifecycleSequencer,
    /// Review queue of the engine that invoked the action
    pub review_tx: mpsc::Sender<Notification>,
    /// Local directory for the action's own processes and logs
    pub work_dir: PathBuf,
    /// Submitting user, used in generated instance names
    pub user: String,
    pub coordination_timeout: Duration,
    pub container_startup_delay: Duration,
}

impl ActionContext {
    pub fn new(config: &MasterConfig, sequencer: LifecycleSequencer, review_tx: mpsc::Sender<Notification>) -> Self {
        Self {
            sequencer,
            review_tx,
            work_dir: config.work_dir.clone(),
            user: std::env::var("USER").unwrap_or_else(|_| "convoy".to_string()),
            coordination_timeout: config.coordination_timeout(),
            container_startup_delay: config.container_startup_delay(),
        }
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }
}

#[derive(Debug)]
pub enum ActionOutcome {
    /// Already done earlier; no process was launched
    NothingToDo,
    /// A lifecycle sequence is now running
    Started(SequenceHandle),
}

impl ActionOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started(_))
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn roles(&self) -> &[ProviderRole];

    /// Provider-specific option and cardinality checks. Runs before any slot is requested.
    fn validate(&self, spec: &ClusterSpec) -> Result<()>;

    fn build_context(&self, role: &str, slot: &Slot, spec: &ClusterSpec) -> Result<ExecutionContext>;

    async fn run_lifecycle_action(
        &self,
        action: LifecycleAction,
        spec: &ClusterSpec,
        env: &ActionContext,
    ) -> Result<ActionOutcome>;

    /// Published facts; stale or empty values rather than errors
    async fn build_status(&self, spec: &ClusterSpec) -> BTreeMap<String, String>;

    fn create_probes(&self, role: &str, spec: &ClusterSpec) -> Vec<Arc<dyn Probe>>;

    /// Human-readable endpoint labels mapped to URLs where one is known
    fn build_monitor_details(&self, status: &BTreeMap<String, String>) -> BTreeMap<String, Option<String>>;

    /// Reject role keys this provider does not know
    fn validate_roles(&self, spec: &ClusterSpec) -> Result<()> {
        for role in spec.roles.keys() {
            if !self.roles().iter().any(|r| &r.name == role) {
                return Err(ConvoyError::configuration(format!(
                    "unknown role '{}' for application '{}'",
                    role,
                    self.name()
                )));
            }
        }
        for known in self.roles() {
            let desired = spec.desired_instances(&known.name);
            if desired < known.min_instances {
                return Err(ConvoyError::configuration(format!(
                    "role '{}' needs at least {} instance(s), {} requested",
                    known.name, known.min_instances, desired
                )));
            }
        }
        Ok(())
    }
}

/// Collaborators handed to a provider when it is created
#[derive(Clone)]
pub struct ProviderDeps {
    pub coordination: CoordinationFactory,
}

impl Default for ProviderDeps {
    fn default() -> Self {
        Self {
            coordination: zookeeper_factory(),
        }
    }
}

/// Hosted-application types this master can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Accumulo,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accumulo => "accumulo",
        }
    }

    pub fn for_spec(spec: &ClusterSpec) -> Result<Self> {
        spec.application.parse()
    }

    pub fn create(&self, deps: &ProviderDeps) -> Arc<dyn Provider> {
        match self {
            Self::Accumulo => Arc::new(AccumuloProvider::new(deps.coordination.clone())),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accumulo" => Ok(Self::Accumulo),
            other => Err(ConvoyError::configuration(format!(
                "unknown application type '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::ErrorKind;

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("Accumulo".parse::<ProviderKind>().unwrap(), ProviderKind::Accumulo);
        let err = "hbase".parse::<ProviderKind>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_validate_roles_rejects_unknown() {
        let provider = ProviderKind::Accumulo.create(&ProviderDeps::default());
        let spec = ClusterSpec::new("c1", "accumulo")
            .with_role("master", crate::spec::RoleSpec::new(1))
            .with_role("region", crate::spec::RoleSpec::new(1));
        let err = provider.validate_roles(&spec).unwrap_err();
        assert!(err.to_string().contains("region"));
    }
}
