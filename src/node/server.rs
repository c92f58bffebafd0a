//! TCP front end for a [`ProxyNode`]
//!
//! Each connection carries JSON lines. Requests on one connection run
//! concurrently so a cancel can overtake the statement it cancels; responses
//! are matched to requests by envelope id. Lines longer than the configured
//! limit are skipped and answered with `MalformedRequest`.

use anyhow::{Context, Result};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

use super::ProxyNode;
use super::wire::{NodeResponse, RequestEnvelope, ResponseEnvelope, decode_line, encode_line};
use crate::error::ProxyError;

/// Responses queued per connection before request handlers wait on the writer
const RESPONSE_QUEUE: usize = 64;

/// Default cap on one request line
pub const MAX_REQUEST_LINE: usize = 8 * 1024 * 1024;

/// Listening socket bound to a node
#[derive(Debug)]
pub struct NodeServer {
    node: Arc<ProxyNode>,
    listener: TcpListener,
    max_line: usize,
}

impl NodeServer {
    /// Bind `addr`; port 0 picks a free port
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(node: Arc<ProxyNode>, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        Ok(Self {
            node,
            listener,
            max_line: MAX_REQUEST_LINE,
        })
    }

    /// Longest request line accepted, in bytes
    #[must_use]
    pub fn max_request_line(mut self, bytes: usize) -> Self {
        self.max_line = bytes;
        self
    }

    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the node shuts down
    ///
    /// # Errors
    ///
    /// Returns an error if the listener fails.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.node.subscribe_shutdown();
        info!(
            node = %self.node.address(),
            listen = %self.local_addr()?,
            "Proxy node listening"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown initiated, stopping accept loop");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    let node = self.node.clone();
                    let shutdown_rx = node.subscribe_shutdown();
                    let max_line = self.max_line;
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(node, stream, peer, max_line, shutdown_rx).await {
                            warn!(%peer, error = %e, "Client connection ended with error");
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

async fn serve_connection(
    node: Arc<ProxyNode>,
    stream: TcpStream,
    peer: SocketAddr,
    max_line: usize,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    debug!(%peer, "Client connected");
    stream.set_nodelay(true)?;
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<ResponseEnvelope>(RESPONSE_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let line = match encode_line(&response) {
                Ok(line) => line,
                Err(e) => {
                    error!(id = response.id, error = %e, "Failed to encode response");
                    continue;
                }
            };
            if write_half.write_all(&line).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(max_line));
    loop {
        let frame = tokio::select! {
            _ = shutdown_rx.recv() => break,
            frame = lines.next() => frame,
        };
        let decoded = match frame {
            None => break,
            Some(Ok(line)) if line.trim().is_empty() => continue,
            Some(Ok(line)) => decode_line::<RequestEnvelope>(&line).map_err(|e| e.to_string()),
            // The codec drops the rest of the oversized line
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                Err(format!("request line exceeds {max_line} bytes"))
            }
            Some(Err(LinesCodecError::Io(e))) => {
                drop(tx);
                let _ = writer.await;
                return Err(e.into());
            }
        };

        let envelope = match decoded {
            Ok(envelope) => envelope,
            Err(reason) => {
                // The id is unknown, so the caller can only match this by id 0
                warn!(%peer, error = %reason, "Malformed request");
                let response = ResponseEnvelope {
                    id: 0,
                    response: NodeResponse::Error(ProxyError::MalformedRequest(reason)),
                };
                if tx.send(response).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let node = node.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let id = envelope.id;
            let response = node.handle(envelope).await;
            let _ = tx.send(ResponseEnvelope { id, response }).await;
        });
    }

    drop(tx);
    let _ = writer.await;
    debug!(%peer, "Client disconnected");
    Ok(())
}
