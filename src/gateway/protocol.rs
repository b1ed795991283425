//! Control protocol gateway
//!
//! Every operation passes the access check before it looks anything up, so
//! a rejected caller learns nothing about which clusters exist.

use super::acl::{AccessPolicy, Caller, Operation};
use crate::core::config::MasterConfig;
use crate::core::errors::{ConvoyError, ErrorKind, Result};
use crate::engine::{ClusterStatus, EngineHandle, ReconciliationEngine, ResourceManager};
use crate::exec::LifecycleSequencer;
use crate::provider::{ProviderDeps, ProviderKind};
use crate::spec::{ClusterSpec, InstanceView};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

/// Serialized request envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    SubmitCluster { spec: ClusterSpec },
    GetStatus { cluster: String },
    Flex { cluster: String, roles: BTreeMap<String, u32> },
    StopCluster { cluster: String },
    ListInstances {
        cluster: String,
        #[serde(default)]
        role: Option<String>,
    },
    RetryLifecycle { cluster: String },
    ListClusters,
}

/// Error body returned to callers: kind and a safe message only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorReply {
    pub fn from_error(error: &ConvoyError) -> Self {
        let message = match error.kind() {
            ErrorKind::Io | ErrorKind::Serialization | ErrorKind::Channel | ErrorKind::Internal => {
                error!(error = %error, source = ?std::error::Error::source(error), "Control request failed internally");
                format!("{} error", error.kind())
            }
            _ => error.to_string(),
        };
        Self {
            kind: error.kind(),
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    Submitted { cluster: String },
    Status { status: Box<ClusterStatus> },
    Flexed,
    Stopped,
    Instances { instances: Vec<InstanceView> },
    Retrying,
    Clusters { clusters: Vec<String> },
    Error(ErrorReply),
}

impl ControlResponse {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Error(reply) => Some(reply.kind),
            _ => None,
        }
    }
}

/// Authorization-gated front door to every cluster engine
pub struct ControlGateway {
    policy: AccessPolicy,
    config: MasterConfig,
    deps: ProviderDeps,
    resources: Arc<dyn ResourceManager>,
    sequencer: LifecycleSequencer,
    clusters: DashMap<String, EngineHandle>,
}

impl ControlGateway {
    pub fn new(config: MasterConfig, resources: Arc<dyn ResourceManager>, deps: ProviderDeps) -> Self {
        Self {
            policy: AccessPolicy::new(&config.acl),
            config,
            deps,
            resources,
            sequencer: LifecycleSequencer::new(),
            clusters: DashMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: AccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn sequencer(&self) -> &LifecycleSequencer {
        &self.sequencer
    }

    /// Engine handle for in-process callers that already passed the check
    pub fn engine(&self, cluster: &str) -> Option<EngineHandle> {
        self.clusters.get(cluster).map(|h| h.value().clone())
    }

    fn lookup(&self, cluster: &str) -> Result<EngineHandle> {
        self.engine(cluster)
            .ok_or_else(|| ConvoyError::ClusterNotFound(cluster.to_string()))
    }

    pub fn submit_cluster(&self, caller: &Caller, spec: ClusterSpec) -> Result<Arc<ClusterStatus>> {
        self.policy.check(caller, Operation::SubmitCluster)?;
        let kind = ProviderKind::for_spec(&spec)?;
        match self.clusters.entry(spec.name.clone()) {
            Entry::Occupied(_) => Err(ConvoyError::ClusterExists(spec.name)),
            Entry::Vacant(slot) => {
                let provider = kind.create(&self.deps);
                let name = spec.name.clone();
                let engine = ReconciliationEngine::new(spec, provider, self.resources.clone(), self.config.clone())?
                    .with_sequencer(self.sequencer.clone());
                let handle = engine.start();
                let status = handle.status();
                slot.insert(handle);
                info!(cluster = %name, provider = %kind, principal = %caller.principal, "Cluster submitted");
                Ok(status)
            }
        }
    }

    pub async fn get_status(&self, caller: &Caller, cluster: &str) -> Result<ClusterStatus> {
        self.policy.check(caller, Operation::GetStatus)?;
        let handle = self.lookup(cluster)?;
        Ok(handle.status_with_provider().await)
    }

    pub async fn flex(&self, caller: &Caller, cluster: &str, roles: BTreeMap<String, u32>) -> Result<()> {
        self.policy.check(caller, Operation::Flex)?;
        self.lookup(cluster)?.flex(roles).await
    }

    pub async fn stop_cluster(&self, caller: &Caller, cluster: &str) -> Result<()> {
        self.policy.check(caller, Operation::StopCluster)?;
        let handle = self.lookup(cluster)?;
        info!(cluster = %cluster, principal = %caller.principal, "Stopping cluster");
        handle.stop().await
    }

    pub async fn list_instances(
        &self,
        caller: &Caller,
        cluster: &str,
        role: Option<&str>,
    ) -> Result<Vec<InstanceView>> {
        self.policy.check(caller, Operation::ListInstances)?;
        let status = self.lookup(cluster)?.status();
        Ok(status
            .instances
            .iter()
            .filter(|i| role.map_or(true, |r| i.role == r))
            .cloned()
            .collect())
    }

    pub async fn retry_lifecycle(&self, caller: &Caller, cluster: &str) -> Result<()> {
        self.policy.check(caller, Operation::RetryLifecycle)?;
        self.lookup(cluster)?.retry_lifecycle().await
    }

    pub fn list_clusters(&self, caller: &Caller) -> Result<Vec<String>> {
        self.policy.check(caller, Operation::ListClusters)?;
        let mut names: Vec<String> = self.clusters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    /// Route a decoded request to its operation
    pub async fn dispatch(&self, caller: &Caller, request: ControlRequest) -> ControlResponse {
        let result = match request {
            ControlRequest::SubmitCluster { spec } => self
                .submit_cluster(caller, spec)
                .map(|status| ControlResponse::Submitted {
                    cluster: status.name.clone(),
                }),
            ControlRequest::GetStatus { cluster } => self
                .get_status(caller, &cluster)
                .await
                .map(|status| ControlResponse::Status {
                    status: Box::new(status),
                }),
            ControlRequest::Flex { cluster, roles } => {
                self.flex(caller, &cluster, roles).await.map(|_| ControlResponse::Flexed)
            }
            ControlRequest::StopCluster { cluster } => self
                .stop_cluster(caller, &cluster)
                .await
                .map(|_| ControlResponse::Stopped),
            ControlRequest::ListInstances { cluster, role } => self
                .list_instances(caller, &cluster, role.as_deref())
                .await
                .map(|instances| ControlResponse::Instances { instances }),
            ControlRequest::RetryLifecycle { cluster } => self
                .retry_lifecycle(caller, &cluster)
                .await
                .map(|_| ControlResponse::Retrying),
            ControlRequest::ListClusters => self
                .list_clusters(caller)
                .map(|clusters| ControlResponse::Clusters { clusters }),
        };
        result.unwrap_or_else(|e| ControlResponse::Error(ErrorReply::from_error(&e)))
    }

    /// JSON in, JSON out
    pub async fn dispatch_json(&self, caller: &Caller, request: &str) -> String {
        let response = match serde_json::from_str::<ControlRequest>(request) {
            Ok(request) => self.dispatch(caller, request).await,
            Err(e) => ControlResponse::Error(ErrorReply {
                kind: ErrorKind::Serialization,
                message: format!("malformed request: {}", e),
            }),
        };
        serde_json::to_string(&response).unwrap_or_else(|e| {
            error!(error = %e, "Failed to encode control response");
            r#"{"result":"error","kind":"serialization","message":"serialization error"}"#.to_string()
        })
    }
}
