//! TCP transport layer for the table network
//!
//! Turns accepted and dialed sockets into [`Peer`]s and publishes them on the
//! add-peer channel. Handshakes and routing belong to the node.

use super::messages::PeerAddr;
use super::peer::{Direction, Peer};
use crate::error::{NodeError, NodeResult};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default number of connect attempts
pub const DEFAULT_DIAL_ATTEMPTS: u32 = 5;

/// Default pause between connect attempts
pub const DEFAULT_DIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Bounded retry for outbound connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_DIAL_ATTEMPTS,
            backoff: DEFAULT_DIAL_BACKOFF,
        }
    }
}

/// Transport layer for table communication
pub struct TcpTransport {
    /// Bound listen address (port resolved)
    listen_addr: SocketAddr,

    /// Taken by the accept loop when it starts
    listener: Mutex<Option<TcpListener>>,

    /// New connections go here
    add_peer: mpsc::Sender<Peer>,

    dial_policy: DialPolicy,

    next_conn_id: AtomicU64,
}

impl TcpTransport {
    /// Bind the listen socket. Port 0 is resolved to the port actually bound.
    pub async fn bind(
        addr: &str,
        add_peer: mpsc::Sender<Peer>,
        dial_policy: DialPolicy,
    ) -> NodeResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let listen_addr = listener.local_addr()?;

        Ok(Self {
            listen_addr,
            listener: Mutex::new(Some(listener)),
            add_peer,
            dial_policy,
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn dial_policy(&self) -> DialPolicy {
        self.dial_policy
    }

    fn next_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Accept connections until `shutdown` fires. Accept errors are logged and
    /// the loop carries on; the listener is closed when this returns.
    pub async fn listen_and_accept(&self, shutdown: CancellationToken) -> NodeResult<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| NodeError::Config("accept loop already running".to_string()))?;

        info!(addr = %self.listen_addr, "listening for players");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(addr = %self.listen_addr, "accept loop stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(addr = %self.listen_addr, remote = %remote, "accepted connection");
                        let peer = Peer::new(self.next_id(), stream, remote, Direction::Inbound, None);
                        if self.add_peer.send(peer).await.is_err() {
                            return Err(NodeError::Shutdown);
                        }
                    }
                    Err(e) => {
                        error!(addr = %self.listen_addr, error = %e, "failed to accept connection");
                    }
                },
            }
        }
    }

    /// Dial `addr` with the configured retry policy and publish the new peer.
    pub async fn dial(&self, addr: &str) -> NodeResult<()> {
        let peer = self.connect(addr).await?;
        self.add_peer
            .send(peer)
            .await
            .map_err(|_| NodeError::Shutdown)
    }

    /// Dial without publishing. Blocks across the whole retry window.
    pub async fn connect(&self, addr: &str) -> NodeResult<Peer> {
        let attempts = self.dial_policy.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let remote = stream.peer_addr()?;
                    debug!(addr, attempt, "connected");
                    return Ok(Peer::new(
                        self.next_id(),
                        stream,
                        remote,
                        Direction::Outbound,
                        Some(PeerAddr::from(addr)),
                    ));
                }
                Err(e) if attempt >= attempts => {
                    return Err(NodeError::Connection {
                        addr: addr.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    warn!(addr, attempt, error = %e, "connect failed, retrying");
                    tokio::time::sleep(self.dial_policy.backoff).await;
                }
            }
        }
    }
}
