//! Client side of the peer transport.
//!
//! Each remote peer gets one long-lived connection. The connection is
//! established eagerly when the peer joins and re-dialed lazily after any
//! transport failure; every call is bounded by a deadline.

use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{read_frame, write_frame, Request, Response};
use crate::peers::Peer;
use crate::types::validate_peer_addr;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// A connection to one remote peer.
pub struct PeerClient {
    addr: String,
    dial_timeout: Duration,
    call_timeout: Duration,
    conn: Mutex<Option<TcpStream>>,
}

impl PeerClient {
    /// Dial a peer. Fails when the address is invalid or the peer is
    /// unreachable within the dial timeout.
    pub async fn connect(addr: &str, dial_timeout: Duration, call_timeout: Duration) -> Result<Self> {
        if !validate_peer_addr(addr) {
            return Err(NetworkError::InvalidAddress(addr.to_string()).into());
        }
        let client = Self {
            addr: addr.to_string(),
            dial_timeout,
            call_timeout,
            conn: Mutex::new(None),
        };
        let stream = client.dial().await?;
        *client.conn.lock().await = Some(stream);
        debug!(addr = %client.addr, "connected to peer");
        Ok(client)
    }

    /// Address of the remote peer.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn dial(&self) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                addr: self.addr.clone(),
                reason: "connect timed out".to_string(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: self.addr.clone(),
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    async fn exchange(stream: &mut TcpStream, req: &Request) -> Result<Response> {
        write_frame(stream, req).await?;
        match read_frame(stream).await? {
            Some(resp) => Ok(resp),
            None => Err(NetworkError::ConnectionClosed.into()),
        }
    }

    async fn roundtrip(&self, req: &Request) -> Result<Response> {
        let mut guard = self.conn.lock().await;
        let stream = match guard.as_mut() {
            Some(stream) => stream,
            None => {
                let stream = self.dial().await?;
                guard.insert(stream)
            }
        };
        let result = Self::exchange(stream, req).await;
        if result.is_err() {
            // The connection may hold a half-written frame; drop it and
            // re-dial on the next call.
            *guard = None;
        }
        result
    }

    async fn call(&self, req: Request) -> Result<Response> {
        match tokio::time::timeout(self.call_timeout, self.roundtrip(&req)).await {
            Ok(result) => result,
            Err(_) => {
                self.conn.lock().await.take();
                Err(Error::Timeout)
            }
        }
    }
}

#[async_trait]
impl Peer for PeerClient {
    async fn get(&self, group: &str, key: &str) -> Result<Vec<u8>> {
        let resp = self
            .call(Request::Get {
                group: group.to_string(),
                key: key.to_string(),
            })
            .await?;
        match resp {
            Response::Value(bytes) => Ok(bytes),
            Response::Error { kind, message } => Err(Response::into_error(kind, message)),
            Response::Deleted(_) => Err(Error::Internal("unexpected response to get".into())),
        }
    }

    async fn delete(&self, group: &str, key: &str) -> Result<bool> {
        let resp = self
            .call(Request::Delete {
                group: group.to_string(),
                key: key.to_string(),
            })
            .await?;
        match resp {
            Response::Deleted(deleted) => Ok(deleted),
            Response::Error { kind, message } => Err(Response::into_error(kind, message)),
            Response::Value(_) => Err(Error::Internal("unexpected response to delete".into())),
        }
    }

    async fn close(&self) {
        self.conn.lock().await.take();
        debug!(addr = %self.addr, "peer connection closed");
    }
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient").field("addr", &self.addr).finish()
    }
}
