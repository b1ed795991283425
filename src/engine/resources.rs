//! Resource manager contract and a local single-host implementation.

use crate::core::config::MasterConfig;
use crate::core::errors::{ConvoyError, Result};
use crate::exec::ExecutionContext;
use crate::spec::Slot;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

/// What the engine asks the resource manager for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRequest {
    pub cluster: String,
    pub role: String,
    pub instance: Uuid,
}

#[async_trait]
pub trait ResourceManager: Send + Sync {
    async fn allocate(&self, request: &SlotRequest) -> Result<Slot>;

    async fn release(&self, slot: &Slot) -> Result<()>;

    /// Materialise the context's local resources in the slot before launch
    async fn stage(&self, _slot: &Slot, _context: &ExecutionContext) -> Result<()> {
        Ok(())
    }
}

/// Hands out slots on this host, each with its own work and log directory
pub struct LocalResourceManager {
    root: PathBuf,
    capacity: usize,
    conf_dir: Option<PathBuf>,
    in_use: Mutex<BTreeSet<String>>,
    next_id: AtomicUsize,
    allocations: AtomicUsize,
}

impl LocalResourceManager {
    /// `capacity` of 0 means unlimited
    pub fn new(root: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            root: root.into(),
            capacity,
            conf_dir: None,
            in_use: Mutex::new(BTreeSet::new()),
            next_id: AtomicUsize::new(0),
            allocations: AtomicUsize::new(0),
        }
    }

    /// Slots under `<work_dir>/slots`, capped at `max_slots`
    pub fn from_config(config: &MasterConfig) -> Self {
        Self::new(config.work_dir.join("slots"), config.max_slots)
    }

    /// Generated configuration directory staged into every slot
    pub fn with_conf_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.conf_dir = Some(dir.into());
        self
    }

    /// Total successful allocations since creation
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn in_use(&self) -> usize {
        self.in_use.lock().len()
    }
}

#[async_trait]
impl ResourceManager for LocalResourceManager {
    async fn allocate(&self, request: &SlotRequest) -> Result<Slot> {
        let id = format!(
            "{}-{}-{}",
            request.cluster,
            request.role,
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        {
            let mut in_use = self.in_use.lock();
            if self.capacity > 0 && in_use.len() >= self.capacity {
                return Err(ConvoyError::BadClusterState(format!(
                    "no free slots ({} of {} in use)",
                    in_use.len(),
                    self.capacity
                )));
            }
            in_use.insert(id.clone());
        }

        let work_dir = self.root.join(&request.cluster).join(&id);
        let log_dir = work_dir.join("logs");
        if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
            self.in_use.lock().remove(&id);
            return Err(ConvoyError::io(format!("create {}", log_dir.display()), e));
        }

        self.allocations.fetch_add(1, Ordering::SeqCst);
        info!(slot = %id, role = %request.role, instance = %request.instance, "Slot allocated");
        Ok(Slot {
            id,
            host: "localhost".to_string(),
            work_dir,
            log_dir,
            conf_dir: self.conf_dir.clone(),
        })
    }

    async fn release(&self, slot: &Slot) -> Result<()> {
        if self.in_use.lock().remove(&slot.id) {
            info!(slot = %slot.id, "Slot released");
        } else {
            debug!(slot = %slot.id, "Release of unknown slot ignored");
        }
        Ok(())
    }

    async fn stage(&self, slot: &Slot, context: &ExecutionContext) -> Result<()> {
        context.stage_into(&slot.work_dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{LocalResource, ResourceKind};
    use std::collections::BTreeMap;

    fn request(role: &str) -> SlotRequest {
        SlotRequest {
            cluster: "c1".into(),
            role: role.into(),
            instance: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_capacity_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let rm = LocalResourceManager::new(dir.path(), 1);
        let slot = rm.allocate(&request("worker")).await.unwrap();
        assert!(slot.log_dir.is_dir());
        assert!(rm.allocate(&request("worker")).await.is_err());

        rm.release(&slot).await.unwrap();
        assert_eq!(rm.in_use(), 0);
        rm.allocate(&request("worker")).await.unwrap();
        assert_eq!(rm.allocations(), 2);
    }

    #[tokio::test]
    async fn test_stage_links_resources() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("conf");
        std::fs::create_dir_all(&conf).unwrap();
        let rm = LocalResourceManager::new(dir.path().join("slots"), 0).with_conf_dir(&conf);
        let slot = rm.allocate(&request("master")).await.unwrap();

        let context = ExecutionContext {
            role: "master".into(),
            slot_id: slot.id.clone(),
            working_dir: slot.work_dir.clone(),
            environment: BTreeMap::new(),
            command: vec!["true".into()],
            local_resources: BTreeMap::from([(
                "propagatedconf".to_string(),
                LocalResource {
                    source: conf.display().to_string(),
                    kind: ResourceKind::Directory,
                },
            )]),
        };
        rm.stage(&slot, &context).await.unwrap();
        assert!(slot.work_dir.join("propagatedconf").is_dir());
        // Staging again is a no-op
        rm.stage(&slot, &context).await.unwrap();
    }
}
