// Ambient infrastructure: errors, configuration, logging
pub mod core;

// Data model
pub mod spec;

// Execution: contexts, supervised children, lifecycle chains
pub mod exec;

// Hosted-application plug-ins and the coordination service they rely on
pub mod coordination;
pub mod provider;

// Control plane
pub mod engine;
pub mod gateway;

// Re-exports for convenience
pub use crate::core::errors::{ConvoyError, ErrorKind, Result};
pub use crate::core::{init_logging, LoggingConfig, MasterConfig};
pub use coordination::{CoordinationClient, MemoryCoordination, ZkCoordinationClient};
pub use engine::{ClusterPhase, ClusterStatus, EngineHandle, LocalResourceManager, ReconciliationEngine, ResourceManager};
pub use exec::{ContextBuilder, ExecutionContext, LifecycleSequencer, SupervisedProcess};
pub use gateway::{AccessPolicy, Caller, ControlGateway, ControlRequest, ControlResponse};
pub use provider::{Provider, ProviderDeps, ProviderKind};
pub use spec::{ClusterSpec, RoleSpec};
