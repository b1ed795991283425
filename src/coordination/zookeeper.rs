//! Minimal ZooKeeper client: session handshake plus `getData`/`getChildren`.
//!
//! Every frame is a big-endian i32 length followed by a jute-encoded record.
//! Each public call opens a short-lived session and closes it afterwards.

use super::CoordinationClient;
use crate::core::errors::{ConvoyError, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

const OP_GET_DATA: i32 = 4;
const OP_GET_CHILDREN: i32 = 8;
const OP_CLOSE_SESSION: i32 = -11;
const ERR_NO_NODE: i32 = -101;
const MAX_FRAME: usize = 4 * 1024 * 1024;
const DEFAULT_SESSION_TIMEOUT_MS: i32 = 10_000;

/// Client for a `host:port[,host:port...][/chroot]` quorum string
#[derive(Debug, Clone)]
pub struct ZkCoordinationClient {
    quorum: String,
    hosts: Vec<String>,
    chroot: String,
    session_timeout_ms: i32,
    read_timeout: Duration,
}

impl ZkCoordinationClient {
    pub fn new(quorum: impl Into<String>) -> Result<Self> {
        let quorum = quorum.into();
        let (hosts_part, chroot) = match quorum.find('/') {
            Some(idx) => (&quorum[..idx], quorum[idx..].trim_end_matches('/').to_string()),
            None => (quorum.as_str(), String::new()),
        };
        let hosts: Vec<String> = hosts_part
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(|h| if h.contains(':') { h.to_string() } else { format!("{}:2181", h) })
            .collect();
        if hosts.is_empty() {
            return Err(ConvoyError::configuration(format!(
                "coordination quorum '{}' names no hosts",
                quorum
            )));
        }
        Ok(Self {
            quorum: quorum.clone(),
            hosts,
            chroot,
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            read_timeout: Duration::from_secs(2),
        })
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    fn full_path(&self, path: &str) -> String {
        let path = if path.starts_with('/') { path.to_string() } else { format!("/{}", path) };
        if self.chroot.is_empty() {
            path
        } else if path == "/" {
            self.chroot.clone()
        } else {
            format!("{}{}", self.chroot, path)
        }
    }

    /// Connect to the first quorum member that accepts a session
    async fn open(&self) -> Result<ZkSession> {
        let mut last_error = None;
        for host in &self.hosts {
            match ZkSession::connect(host, self.session_timeout_ms).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    debug!(host = %host, error = %e, "Coordination host refused session");
                    last_error = Some(e);
                }
            }
        }
        Err(ConvoyError::coordination_unavailable(
            &self.quorum,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no hosts".to_string()),
        ))
    }

    async fn bounded<T, F>(&self, timeout: Duration, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ConvoyError::coordination_unavailable(
                &self.quorum,
                format!("no response within {}ms", timeout.as_millis()),
            )),
        }
    }
}

#[async_trait]
impl CoordinationClient for ZkCoordinationClient {
    fn address(&self) -> &str {
        &self.quorum
    }

    async fn verify_live(&self, timeout: Duration) -> Result<()> {
        let root = self.full_path("/");
        let result = self
            .bounded(timeout, async {
                let mut session = self.open().await?;
                session.get_children(&root).await?;
                session.close().await;
                Ok(())
            })
            .await;
        match &result {
            Ok(()) => info!(quorum = %self.quorum, "Coordination service is live"),
            Err(e) => warn!(quorum = %self.quorum, error = %e, "Coordination liveness check failed"),
        }
        result
    }

    async fn read_published(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let path = self.full_path(path);
        self.bounded(self.read_timeout, async {
            let mut session = self.open().await?;
            let data = session.get_data(&path).await?;
            session.close().await;
            Ok(data)
        })
        .await
    }

    async fn list_children(&self, path: &str) -> Result<Option<Vec<String>>> {
        let path = self.full_path(path);
        self.bounded(self.read_timeout, async {
            let mut session = self.open().await?;
            let children = session.get_children(&path).await?;
            session.close().await;
            Ok(children)
        })
        .await
    }
}

struct ZkSession {
    host: String,
    stream: TcpStream,
    xid: i32,
}

impl ZkSession {
    async fn connect(host: &str, session_timeout_ms: i32) -> Result<Self> {
        let stream = TcpStream::connect(host)
            .await
            .map_err(|e| ConvoyError::coordination_unavailable(host, e.to_string()))?;
        let mut session = Self {
            host: host.to_string(),
            stream,
            xid: 0,
        };

        let mut req = BytesMut::with_capacity(48);
        req.put_i32(0); // protocol version
        req.put_i64(0); // last zxid seen
        req.put_i32(session_timeout_ms);
        req.put_i64(0); // session id
        put_buffer(&mut req, Some(&[0u8; 16]));
        req.put_u8(0); // read-only not requested
        session.write_frame(&req).await?;

        let mut resp = session.read_frame().await?;
        let _protocol = get_i32(&mut resp)?;
        let negotiated_timeout = get_i32(&mut resp)?;
        let session_id = get_i64(&mut resp)?;
        if negotiated_timeout <= 0 {
            return Err(ConvoyError::coordination_unavailable(host, "session rejected by server"));
        }
        debug!(host = %host, session_id, "Coordination session established");
        Ok(session)
    }

    async fn get_data(&mut self, path: &str) -> Result<Option<Vec<u8>>> {
        let mut body = self.request(OP_GET_DATA, path).await?;
        let Some(body) = body.as_mut() else {
            return Ok(None);
        };
        get_buffer(body)
    }

    async fn get_children(&mut self, path: &str) -> Result<Option<Vec<String>>> {
        let mut body = self.request(OP_GET_CHILDREN, path).await?;
        let Some(body) = body.as_mut() else {
            return Ok(None);
        };
        let count = get_i32(body)?;
        let mut children = Vec::with_capacity(count.clamp(0, 1024) as usize);
        for _ in 0..count.max(0) {
            let name = get_buffer(body)?.unwrap_or_default();
            children.push(String::from_utf8_lossy(&name).into_owned());
        }
        Ok(Some(children))
    }

    /// Send a path request; `None` when the node does not exist
    async fn request(&mut self, op: i32, path: &str) -> Result<Option<Bytes>> {
        self.xid += 1;
        let xid = self.xid;
        let mut req = BytesMut::with_capacity(16 + path.len());
        req.put_i32(xid);
        req.put_i32(op);
        put_buffer(&mut req, Some(path.as_bytes()));
        req.put_u8(0); // no watch
        self.write_frame(&req).await?;

        loop {
            let mut resp = self.read_frame().await?;
            let reply_xid = get_i32(&mut resp)?;
            let _zxid = get_i64(&mut resp)?;
            let err = get_i32(&mut resp)?;
            if reply_xid != xid {
                // Pings and notifications are not ours
                continue;
            }
            return match err {
                0 => Ok(Some(resp)),
                ERR_NO_NODE => Ok(None),
                code => Err(ConvoyError::coordination_unavailable(
                    &self.host,
                    format!("request for {} failed with error code {}", path, code),
                )),
            };
        }
    }

    async fn close(mut self) {
        let mut req = BytesMut::with_capacity(8);
        req.put_i32(self.xid + 1);
        req.put_i32(OP_CLOSE_SESSION);
        let _ = self.write_frame(&req).await;
        let _ = self.stream.shutdown().await;
    }

    async fn write_frame(&mut self, body: &[u8]) -> Result<()> {
        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_i32(body.len() as i32);
        frame.put_slice(body);
        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| ConvoyError::coordination_unavailable(&self.host, e.to_string()))
    }

    async fn read_frame(&mut self) -> Result<Bytes> {
        let len = self
            .stream
            .read_i32()
            .await
            .map_err(|e| ConvoyError::coordination_unavailable(&self.host, e.to_string()))?;
        if len < 0 || len as usize > MAX_FRAME {
            return Err(ConvoyError::coordination_unavailable(
                &self.host,
                format!("invalid frame length {}", len),
            ));
        }
        let mut buf = vec![0u8; len as usize];
        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| ConvoyError::coordination_unavailable(&self.host, e.to_string()))?;
        Ok(Bytes::from(buf))
    }
}

fn put_buffer(buf: &mut BytesMut, data: Option<&[u8]>) {
    match data {
        Some(data) => {
            buf.put_i32(data.len() as i32);
            buf.put_slice(data);
        }
        None => buf.put_i32(-1),
    }
}

fn truncated() -> ConvoyError {
    ConvoyError::internal("truncated coordination response")
}

fn get_i32(buf: &mut Bytes) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_i32())
}

fn get_i64(buf: &mut Bytes) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(truncated());
    }
    Ok(buf.get_i64())
}

fn get_buffer(buf: &mut Bytes) -> Result<Option<Vec<u8>>> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    Ok(Some(buf.split_to(len).to_vec()))
}
