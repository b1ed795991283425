//! Coordination service access
//!
//! The hosted application uses an external quorum service for leader
//! election and for publishing its endpoints. The master only checks that
//! the service is live (bounded wait) and reads published values (best
//! effort, absence is a normal answer).

pub mod zookeeper;

pub use zookeeper::ZkCoordinationClient;

use crate::core::errors::{ConvoyError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Quorum address this client talks to
    fn address(&self) -> &str;

    /// Open a session and perform one trivial read, waiting at most `timeout`
    async fn verify_live(&self, timeout: Duration) -> Result<()>;

    /// Payload at `path`; `None` if nothing has been published there yet
    async fn read_published(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Child names of `path`; `None` if the node does not exist
    async fn list_children(&self, path: &str) -> Result<Option<Vec<String>>>;
}

/// Creates a client for a quorum string
pub type CoordinationFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn CoordinationClient>> + Send + Sync>;

/// Factory producing ZooKeeper wire clients
pub fn zookeeper_factory() -> CoordinationFactory {
    Arc::new(|quorum: &str| {
        let client: Arc<dyn CoordinationClient> = Arc::new(ZkCoordinationClient::new(quorum)?);
        Ok(client)
    })
}

/// Best-effort UTF-8 read; any failure is treated as "not published yet"
pub async fn read_published_text(client: &dyn CoordinationClient, path: &str) -> Option<String> {
    match client.read_published(path).await {
        Ok(Some(bytes)) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Ok(None) => None,
        Err(e) => {
            tracing::debug!(path = %path, error = %e, "Published value not readable yet");
            None
        }
    }
}

/// In-process coordination service for tests and standalone runs
#[derive(Clone)]
pub struct MemoryCoordination {
    address: String,
    nodes: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    reachable: Arc<AtomicBool>,
}

impl MemoryCoordination {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            nodes: Arc::new(RwLock::new(BTreeMap::new())),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn publish(&self, path: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.nodes.write().insert(path.into(), data.into());
    }

    pub fn remove(&self, path: &str) {
        self.nodes.write().remove(path);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Factory that hands out this same instance for any quorum string
    pub fn factory(&self) -> CoordinationFactory {
        let this = self.clone();
        Arc::new(move |_quorum: &str| {
            let client: Arc<dyn CoordinationClient> = Arc::new(this.clone());
            Ok(client)
        })
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConvoyError::coordination_unavailable(&self.address, "connection refused"))
        }
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordination {
    fn address(&self) -> &str {
        &self.address
    }

    async fn verify_live(&self, _timeout: Duration) -> Result<()> {
        self.ensure_reachable()
    }

    async fn read_published(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_reachable()?;
        Ok(self.nodes.read().get(path).cloned())
    }

    async fn list_children(&self, path: &str) -> Result<Option<Vec<String>>> {
        self.ensure_reachable()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let nodes = self.nodes.read();
        let children: BTreeSet<String> = nodes
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(|rest| rest.split('/').next().unwrap_or(rest).to_string())
            .collect();
        if children.is_empty() && !nodes.contains_key(path) {
            return Ok(None);
        }
        Ok(Some(children.into_iter().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_children_and_reads() {
        let zk = MemoryCoordination::new("mem:2181");
        zk.publish("/app/id/masters/lock/lock-0002", "m2:9999");
        zk.publish("/app/id/masters/lock/lock-0001", "m1:9999");
        zk.publish("/app/id/monitor/http_addr", "mon:50095");

        let children = zk.list_children("/app/id/masters/lock").await.unwrap().unwrap();
        assert_eq!(children, vec!["lock-0001", "lock-0002"]);
        assert_eq!(zk.list_children("/app/id").await.unwrap().unwrap(), vec!["masters", "monitor"]);
        assert_eq!(zk.list_children("/absent").await.unwrap(), None);
        assert_eq!(
            read_published_text(&zk, "/app/id/monitor/http_addr").await.as_deref(),
            Some("mon:50095")
        );
    }

    #[tokio::test]
    async fn test_children_listed_once_when_siblings_interleave() {
        let zk = MemoryCoordination::new("mem:2181");
        zk.publish("/app/b", "0");
        zk.publish("/app/b/x", "1");
        zk.publish("/app/b-c", "2");
        zk.publish("/app/b/y", "3");

        let children = zk.list_children("/app").await.unwrap().unwrap();
        assert_eq!(children, vec!["b", "b-c"]);
    }

    #[tokio::test]
    async fn test_unreachable_memory_service() {
        let zk = MemoryCoordination::new("mem:2181");
        zk.set_reachable(false);
        let err = zk.verify_live(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err.kind(), crate::core::errors::ErrorKind::CoordinationUnavailable);
        assert_eq!(read_published_text(&zk, "/anything").await, None);
    }
}
