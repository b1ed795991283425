//! Point-in-time cluster status published by the engine.

use crate::core::errors::{ConvoyError, ErrorKind};
use crate::spec::{ClusterSpec, InstanceError, InstanceState, InstanceView};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterPhase {
    /// One-off lifecycle action in progress
    Initializing,
    Active,
    /// Lifecycle action or cluster configuration failed; waits for an
    /// operator retry
    Failed,
    Stopped,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Per-role counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSummary {
    pub desired: u32,
    /// Requested through running
    pub live: u32,
    pub running: u32,
    pub failed: u32,
    /// Set once the role failed too often to be replaced automatically
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted: Option<InstanceError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub name: String,
    pub application: String,
    pub phase: ClusterPhase,
    pub spec: ClusterSpec,
    pub roles: BTreeMap<String, RoleSummary>,
    pub instances: Vec<InstanceView>,
    /// Error that moved the cluster to `Failed`
    pub lifecycle_error: Option<InstanceError>,
    /// Published facts from the provider; filled in at query time
    #[serde(default)]
    pub provider_status: BTreeMap<String, String>,
    #[serde(default)]
    pub monitor_details: BTreeMap<String, Option<String>>,
    pub updated_at: DateTime<Utc>,
}

impl ClusterStatus {
    pub fn new(spec: ClusterSpec, phase: ClusterPhase, instances: Vec<InstanceView>) -> Self {
        let roles = summarize(&spec, &instances);
        Self {
            name: spec.name.clone(),
            application: spec.application.clone(),
            phase,
            spec,
            roles,
            instances,
            lifecycle_error: None,
            provider_status: BTreeMap::new(),
            monitor_details: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_lifecycle_error(mut self, error: Option<InstanceError>) -> Self {
        self.lifecycle_error = error;
        self
    }

    /// Mark roles that are no longer replaced
    pub fn with_halted_roles(mut self, halted: &BTreeMap<String, InstanceError>) -> Self {
        for (role, error) in halted {
            self.roles.entry(role.clone()).or_default().halted = Some(error.clone());
        }
        self
    }

    pub fn halted(&self, role: &str) -> Option<&InstanceError> {
        self.roles.get(role).and_then(|r| r.halted.as_ref())
    }

    pub fn running(&self, role: &str) -> u32 {
        self.roles.get(role).map(|r| r.running).unwrap_or(0)
    }

    pub fn instances_in(&self, state: InstanceState) -> impl Iterator<Item = &InstanceView> {
        self.instances.iter().filter(move |i| i.state == state)
    }

    /// Error kinds currently attached to instances, by instance id
    pub fn instance_errors(&self) -> BTreeMap<String, ErrorKind> {
        self.instances
            .iter()
            .filter_map(|i| i.error.as_ref().map(|e| (i.id.to_string(), e.kind)))
            .collect()
    }

    /// Pretty JSON for diagnostics; never fails, renders the error text instead
    pub fn to_json(&self) -> String {
        match serde_json::to_string_pretty(self) {
            Ok(json) => json,
            Err(e) => {
                let error = ConvoyError::serialization("json", e);
                tracing::warn!(cluster = %self.name, error = %error, "Status rendering failed");
                format!("Failed to render cluster status: {}", error)
            }
        }
    }
}

fn summarize(spec: &ClusterSpec, instances: &[InstanceView]) -> BTreeMap<String, RoleSummary> {
    let mut roles: BTreeMap<String, RoleSummary> = spec
        .roles
        .iter()
        .map(|(name, role)| {
            (
                name.clone(),
                RoleSummary {
                    desired: role.instances,
                    ..Default::default()
                },
            )
        })
        .collect();
    for instance in instances {
        let summary = roles.entry(instance.role.clone()).or_default();
        if instance.state.is_live() {
            summary.live += 1;
        }
        match instance.state {
            InstanceState::Running => summary.running += 1,
            InstanceState::Failed => summary.failed += 1,
            _ => {}
        }
    }
    roles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{InstanceHealth, RoleSpec};
    use uuid::Uuid;

    fn view(role: &str, state: InstanceState) -> InstanceView {
        InstanceView {
            id: Uuid::new_v4(),
            role: role.into(),
            slot_id: None,
            host: None,
            state,
            requested_at: Utc::now(),
            started_at: None,
            error: None,
            health: InstanceHealth::Unknown,
        }
    }

    #[test]
    fn test_role_summary() {
        let spec = ClusterSpec::new("c1", "accumulo")
            .with_role("master", RoleSpec::new(1))
            .with_role("worker", RoleSpec::new(3));
        let status = ClusterStatus::new(
            spec,
            ClusterPhase::Active,
            vec![
                view("master", InstanceState::Running),
                view("worker", InstanceState::Running),
                view("worker", InstanceState::Launching),
                view("worker", InstanceState::Failed),
            ],
        );
        assert_eq!(status.running("master"), 1);
        let worker = &status.roles["worker"];
        assert_eq!((worker.desired, worker.live, worker.running, worker.failed), (3, 2, 1, 1));
        assert!(status.to_json().contains("\"phase\": \"active\""));
        assert!(!status.to_json().contains("halted"));
    }

    #[test]
    fn test_halted_roles_reported() {
        let spec = ClusterSpec::new("c1", "accumulo").with_role("worker", RoleSpec::new(2));
        let halted = BTreeMap::from([(
            "worker".to_string(),
            InstanceError {
                kind: ErrorKind::ProcessFailure,
                message: "too many failures".into(),
            },
        )]);
        let status = ClusterStatus::new(spec, ClusterPhase::Active, Vec::new()).with_halted_roles(&halted);
        assert_eq!(status.halted("worker").map(|e| e.kind), Some(ErrorKind::ProcessFailure));
        assert!(status.halted("master").is_none());
    }
}
