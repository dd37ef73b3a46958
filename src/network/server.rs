//! TCP server answering peer `Get`/`Delete` requests.

use crate::error::{Error, NetworkError, Result};
use crate::group::{self, GroupRegistry};
use crate::network::rpc::{read_frame, write_frame, Request, Response};
use crate::registry::ServiceRegistry;
use crate::types::{key_preview, validate_peer_addr, ByteView};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Server half of the peer transport.
///
/// Each node runs one `CacheServer`; requests are dispatched to groups in
/// the configured registry. When a service registry is attached, the
/// server publishes its address on startup and retracts it on shutdown.
pub struct CacheServer {
    addr: String,
    groups: Arc<GroupRegistry>,
    registry: Option<Box<dyn ServiceRegistry>>,
    shutdown_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
    active_connections: Arc<AtomicUsize>,
}

impl CacheServer {
    /// Create a server bound to `addr` and serving the process-wide group
    /// registry. Returns the server and its shutdown handle.
    pub fn new(addr: &str) -> Result<(Self, mpsc::Sender<()>)> {
        if !validate_peer_addr(addr) {
            return Err(NetworkError::InvalidAddress(addr.to_string()).into());
        }
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let server = Self {
            addr: addr.to_string(),
            groups: group::global(),
            registry: None,
            shutdown_rx,
            cancel: CancellationToken::new(),
            active_connections: Arc::new(AtomicUsize::new(0)),
        };
        Ok((server, shutdown_tx))
    }

    /// Serve a specific group registry instead of the process-wide one.
    pub fn with_groups(mut self, groups: Arc<GroupRegistry>) -> Self {
        self.groups = groups;
        self
    }

    /// Attach a service registry; the server publishes its address when it
    /// starts and retracts it when shut down.
    pub fn with_registry(mut self, registry: Box<dyn ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// The address this server binds.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Run the accept loop until the shutdown handle fires.
    pub async fn run(mut self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(NetworkError::Io)?;

        // Publishing must succeed before serving; a node invisible to its
        // peers would own ring slots nobody can route to.
        if let Some(registry) = self.registry.as_mut() {
            registry.publish(&self.addr).await?;
        }

        info!(addr = %self.addr, "cache server listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "accepted connection");
                            let groups = self.groups.clone();
                            let cancel = self.cancel.clone();
                            let active = self.active_connections.clone();
                            active.fetch_add(1, Ordering::SeqCst);

                            tokio::spawn(async move {
                                let result =
                                    Self::handle_connection(stream, groups, cancel).await;
                                active.fetch_sub(1, Ordering::SeqCst);
                                if let Err(e) = result {
                                    debug!(error = %e, "connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!(
                        addr = %self.addr,
                        active = self.active_connections.load(Ordering::SeqCst),
                        "cache server shutting down"
                    );
                    self.cancel.cancel();

                    let deadline = std::time::Instant::now() + Duration::from_millis(500);
                    while self.active_connections.load(Ordering::SeqCst) > 0 {
                        if std::time::Instant::now() > deadline {
                            warn!(
                                active = self.active_connections.load(Ordering::SeqCst),
                                "shutdown timeout, dropping remaining connections"
                            );
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }

                    if let Some(registry) = self.registry.as_mut() {
                        if let Err(e) = registry.shutdown().await {
                            warn!(error = %e, "registry retract failed");
                        }
                    }

                    info!(addr = %self.addr, "cache server shutdown complete");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        groups: Arc<GroupRegistry>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let request: Request = tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(()),

                frame = read_frame(&mut stream) => match frame? {
                    Some(request) => request,
                    None => return Ok(()),
                },
            };

            let response = Self::dispatch(&groups, request).await;
            write_frame(&mut stream, &response).await?;
        }
    }

    async fn dispatch(groups: &GroupRegistry, request: Request) -> Response {
        match request {
            Request::Get { group, key } => {
                debug!(group = %group, key = key_preview(&key), "rpc get");
                match Self::handle_get(groups, &group, &key).await {
                    Ok(value) => Response::Value(value.to_vec()),
                    Err(e) => {
                        Self::log_failure(&group, &key, &e);
                        Response::from_error(&e)
                    }
                }
            }
            Request::Delete { group, key } => {
                debug!(group = %group, key = key_preview(&key), "rpc delete");
                match Self::handle_delete(groups, &group, &key).await {
                    Ok(deleted) => Response::Deleted(deleted),
                    Err(e) => {
                        Self::log_failure(&group, &key, &e);
                        Response::from_error(&e)
                    }
                }
            }
        }
    }

    fn log_failure(group: &str, key: &str, err: &Error) {
        if err.is_caller_error() || matches!(err.unshared(), Error::NotFound) {
            debug!(group, key = key_preview(key), error = %err, "request failed");
        } else {
            warn!(group, key = key_preview(key), error = %err, "request failed");
        }
    }

    async fn handle_get(groups: &GroupRegistry, group: &str, key: &str) -> Result<ByteView> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let group = groups
            .get(group)
            .ok_or_else(|| Error::GroupNotFound(group.to_string()))?;
        group.get(key).await
    }

    async fn handle_delete(groups: &GroupRegistry, group: &str, key: &str) -> Result<bool> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let group = groups
            .get(group)
            .ok_or_else(|| Error::GroupNotFound(group.to_string()))?;
        group.delete(key).await
    }
}

impl std::fmt::Debug for CacheServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheServer")
            .field("addr", &self.addr)
            .field("registered", &self.registry.is_some())
            .finish()
    }
}
