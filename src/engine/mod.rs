//! Reconciliation engine, its resource manager contract and status snapshots.

pub mod reconciler;
pub mod resources;
pub mod status;

pub use reconciler::{EngineCommand, EngineHandle, ReconciliationEngine};
pub use resources::{LocalResourceManager, ResourceManager, SlotRequest};
pub use status::{ClusterPhase, ClusterStatus, RoleSummary};
