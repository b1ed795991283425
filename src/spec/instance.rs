//! Role instances and execution slots.

use crate::core::errors::ErrorKind;
use crate::exec::process::ProcessHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// A resource-manager-granted unit where one process may run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: String,
    pub host: String,
    /// Container working directory
    pub work_dir: PathBuf,
    /// Directory that receives the container's stdout/stderr
    pub log_dir: PathBuf,
    /// Generated configuration directory to stage into the container, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf_dir: Option<PathBuf>,
}

/// Lifecycle of a role instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Requested,
    Allocated,
    ContextBuilt,
    Launching,
    Running,
    Failed,
    Stopped,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Allocated => "allocated",
            Self::ContextBuilt => "context_built",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Counts toward the role's desired instances
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Failed | Self::Stopped)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_live()
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Probe-derived health, independent of lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InstanceHealth {
    Unknown,
    Healthy,
    Degraded { reason: String },
}

/// One allocated execution slot bound to a role. Owned by the engine.
#[derive(Debug)]
pub struct RoleInstance {
    pub id: Uuid,
    pub role: String,
    pub slot: Option<Slot>,
    pub process: Option<ProcessHandle>,
    pub state: InstanceState,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub error: Option<InstanceError>,
    pub health: InstanceHealth,
}

/// Last error recorded against an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RoleInstance {
    pub fn requested(role: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: role.into(),
            slot: None,
            process: None,
            state: InstanceState::Requested,
            requested_at: Utc::now(),
            started_at: None,
            error: None,
            health: InstanceHealth::Unknown,
        }
    }

    pub fn view(&self) -> InstanceView {
        InstanceView {
            id: self.id,
            role: self.role.clone(),
            slot_id: self.slot.as_ref().map(|s| s.id.clone()),
            host: self.slot.as_ref().map(|s| s.host.clone()),
            state: self.state,
            requested_at: self.requested_at,
            started_at: self.started_at,
            error: self.error.clone(),
            health: self.health.clone(),
        }
    }
}

/// Serializable point-in-time view of a role instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceView {
    pub id: Uuid,
    pub role: String,
    pub slot_id: Option<String>,
    pub host: Option<String>,
    pub state: InstanceState,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub error: Option<InstanceError>,
    pub health: InstanceHealth,
}
