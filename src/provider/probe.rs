//! Health probes
//!
//! A probe is a point-in-time check against one running instance. Its
//! result only ever feeds instance health, never lifecycle state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use uuid::Uuid;

/// What a probe is pointed at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTarget {
    pub instance: Uuid,
    pub role: String,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub probe: String,
    pub instance: Uuid,
    pub healthy: bool,
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &str;

    /// Ok means healthy; the error text becomes the degraded reason
    async fn check(&self, target: &ProbeTarget) -> anyhow::Result<()>;
}

/// Run one probe with an upper bound on how long it may take
pub async fn run_probe(probe: &dyn Probe, target: &ProbeTarget, timeout: Duration) -> ProbeReport {
    let result = match tokio::time::timeout(timeout, probe.check(target)).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("probe timed out after {}ms", timeout.as_millis())),
    };
    ProbeReport {
        probe: probe.name().to_string(),
        instance: target.instance,
        healthy: result.is_ok(),
        message: result.err().map(|e| format!("{:#}", e)),
        checked_at: Utc::now(),
    }
}

/// Healthy when a TCP connection to the instance's port succeeds
#[derive(Debug, Clone)]
pub struct TcpPortProbe {
    name: String,
    port: u16,
}

impl TcpPortProbe {
    pub fn new(port: u16) -> Self {
        Self {
            name: format!("tcp:{}", port),
            port,
        }
    }
}

#[async_trait]
impl Probe for TcpPortProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, target: &ProbeTarget) -> anyhow::Result<()> {
        let address = format!("{}:{}", target.host, self.port);
        TcpStream::connect(&address)
            .await
            .map_err(|e| anyhow::anyhow!("cannot connect to {}: {}", address, e))?;
        Ok(())
    }
}
