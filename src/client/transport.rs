//! How the router reaches a node
//!
//! [`TcpTransport`] keeps one multiplexed JSON-lines stream per endpoint.
//! [`InProcessTransport`] calls nodes living in the same process and can
//! simulate a node becoming unreachable.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Endpoint;
use crate::error::TransportError;
use crate::node::{NodeResponse, ProxyNode, RequestEnvelope, ResponseEnvelope, decode_line, encode_line};

/// Request/response exchange with one node
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Send `request` to `endpoint` and wait for its response
    ///
    /// Errors mean the node could not be reached; errors the node itself
    /// returns arrive as [`NodeResponse::Error`].
    async fn send(
        &self,
        endpoint: &Endpoint,
        request: RequestEnvelope,
    ) -> Result<NodeResponse, TransportError>;
}

type Pending = Arc<DashMap<u64, oneshot::Sender<NodeResponse>>>;

/// One open stream to a node
struct TcpChannel {
    writer: Mutex<OwnedWriteHalf>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl TcpChannel {
    fn new(stream: TcpStream, address: String) -> Self {
        let (read_half, write_half) = stream.into_split();
        let pending: Pending = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_responses(
            read_half,
            address,
            pending.clone(),
            closed.clone(),
        ));
        Self {
            writer: Mutex::new(write_half),
            pending,
            closed,
            reader,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_responses(read_half: OwnedReadHalf, address: String, pending: Pending, closed: Arc<AtomicBool>) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match decode_line::<ResponseEnvelope>(&line) {
                Ok(envelope) => {
                    if let Some((_, tx)) = pending.remove(&envelope.id) {
                        let _ = tx.send(envelope.response);
                    }
                }
                Err(e) => warn!(node = %address, error = %e, "Discarding undecodable response"),
            },
            Ok(None) => break,
            Err(e) => {
                debug!(node = %address, error = %e, "Node stream failed");
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
    // Dropping the senders fails every waiter
    pending.clear();
}

/// JSON lines over TCP
pub struct TcpTransport {
    channels: DashMap<String, Arc<TcpChannel>>,
    timeout: Duration,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("channels", &self.channels.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TcpTransport {
    /// Transport whose connects and requests give up after `timeout`
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            channels: DashMap::new(),
            timeout,
        }
    }

    async fn channel(&self, address: &str) -> Result<Arc<TcpChannel>, TransportError> {
        if let Some(channel) = self.channels.get(address)
            && !channel.is_closed()
        {
            return Ok(channel.clone());
        }

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::DeadlineExceeded(self.timeout))??;
        stream.set_nodelay(true)?;
        debug!(node = %address, "Connected to node");
        let channel = Arc::new(TcpChannel::new(stream, address.to_string()));
        self.channels.insert(address.to_string(), channel.clone());
        Ok(channel)
    }

    fn forget(&self, address: &str) {
        self.channels.remove(address);
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(
        &self,
        endpoint: &Endpoint,
        request: RequestEnvelope,
    ) -> Result<NodeResponse, TransportError> {
        let address = endpoint.address();
        let channel = self.channel(&address).await?;
        let id = request.id;
        let line = encode_line(&request)?;

        let (tx, rx) = oneshot::channel();
        channel.pending.insert(id, tx);
        let written = channel.writer.lock().await.write_all(&line).await;
        if let Err(e) = written {
            channel.pending.remove(&id);
            self.forget(&address);
            return Err(e.into());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.forget(&address);
                Err(TransportError::Unavailable(format!(
                    "connection to {address} closed"
                )))
            }
            Err(_) => {
                channel.pending.remove(&id);
                Err(TransportError::DeadlineExceeded(self.timeout))
            }
        }
    }
}

/// Nodes in the same process, addressed by `host:port`
#[derive(Debug, Default)]
pub struct InProcessTransport {
    nodes: DashMap<String, Arc<ProxyNode>>,
    unreachable: DashSet<String>,
}

impl InProcessTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `endpoint`'s address to `node`
    pub fn bind(&self, address: impl Into<String>, node: Arc<ProxyNode>) {
        self.nodes.insert(address.into(), node);
    }

    /// Make `address` unreachable until [`Self::restore`]
    pub fn cut(&self, address: &str) {
        self.unreachable.insert(address.to_string());
    }

    pub fn restore(&self, address: &str) {
        self.unreachable.remove(address);
    }

    #[must_use]
    pub fn node(&self, address: &str) -> Option<Arc<ProxyNode>> {
        self.nodes.get(address).map(|n| n.value().clone())
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn send(
        &self,
        endpoint: &Endpoint,
        request: RequestEnvelope,
    ) -> Result<NodeResponse, TransportError> {
        let address = endpoint.address();
        if self.unreachable.contains(&address) {
            return Err(TransportError::Unavailable(format!("{address} is unreachable")));
        }
        let node = self
            .node(&address)
            .ok_or_else(|| TransportError::Unavailable(format!("no node bound at {address}")))?;
        Ok(node.handle(request).await)
    }
}
