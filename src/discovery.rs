//! Zero-configuration discovery over UDP.
//!
//! Clients broadcast [`DISCOVERY_TOKEN`] to the well-known port and every
//! server on the network answers the sender directly with a JSON
//! [`DiscoveryAnnouncement`]. Anything else arriving on the port is ignored
//! without a reply.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Well-known discovery port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 41234;

/// Exact payload of a discovery query.
pub const DISCOVERY_TOKEN: &[u8] = b"FILE_SHARE_DISCOVERY";

/// Value of the `service` field in every announcement.
pub const SERVICE_ID: &str = "file-share";

/// Replies allowed in flight at once; queries beyond this are dropped.
const MAX_IN_FLIGHT_REPLIES: usize = 256;

/// Largest datagram read. Queries are tiny; anything bigger is not a query.
const MAX_DATAGRAM: usize = 512;

/// Errors raised while starting discovery or probing for servers.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to bind discovery socket on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("discovery socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Where to reach this server, sent in reply to a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryAnnouncement {
    pub service: String,
    #[serde(rename = "name")]
    pub service_name: String,
    pub address: IpAddr,
    pub port: u16,
    pub url: String,
}

impl DiscoveryAnnouncement {
    pub fn new(service_name: impl Into<String>, address: IpAddr, port: u16) -> Self {
        Self {
            service: SERVICE_ID.to_string(),
            service_name: service_name.into(),
            address,
            port,
            url: server_url(address, port),
        }
    }
}

/// `http://address:port`, bracketing IPv6 addresses.
pub fn server_url(address: IpAddr, port: u16) -> String {
    format!("http://{}", SocketAddr::new(address, port))
}

/// The address of the interface this host would use to reach `peer`.
///
/// A route back to a client always exists once its query has arrived, so this
/// works on isolated networks without a default gateway. Loopback is only
/// returned for a loopback peer. No packet is sent.
pub async fn local_address_towards(peer: SocketAddr) -> Option<IpAddr> {
    let bind: SocketAddr = if peer.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await.ok()?;
    socket.connect(peer).await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    let usable = !ip.is_unspecified() && (!ip.is_loopback() || peer.ip().is_loopback());
    usable.then_some(ip)
}

/// This host's address on the local network, if it has a default route.
///
/// Asks the OS which interface would route towards a public address; no
/// packet is sent. Discovery replies prefer [`local_address_towards`].
pub fn local_network_address() -> Option<IpAddr> {
    let socket = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}

/// Settings for a [`DiscoveryResponder`].
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Address the responder listens on.
    pub bind: SocketAddr,
    /// Name announced to clients.
    pub service_name: String,
    /// Port the HTTP service is reachable on.
    pub service_port: u16,
    /// Announced address; looked up per query when `None`.
    pub advertised_address: Option<IpAddr>,
}

impl DiscoveryConfig {
    pub fn new(service_name: impl Into<String>, service_port: u16) -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_DISCOVERY_PORT)),
            service_name: service_name.into(),
            service_port,
            advertised_address: None,
        }
    }

    /// Announcement for a query that arrived from `peer`.
    async fn announcement_for(&self, peer: SocketAddr) -> DiscoveryAnnouncement {
        let address = match self.advertised_address {
            Some(address) => address,
            None => match local_address_towards(peer).await.or_else(local_network_address) {
                Some(address) => address,
                None => {
                    debug!(%peer, "no local network address found, announcing loopback");
                    IpAddr::V4(Ipv4Addr::LOCALHOST)
                }
            },
        };
        DiscoveryAnnouncement::new(&self.service_name, address, self.service_port)
    }
}

/// Bound discovery socket, ready to answer queries.
pub struct DiscoveryResponder {
    socket: Arc<UdpSocket>,
    config: Arc<DiscoveryConfig>,
    replies: Arc<Semaphore>,
}

/// Handle to a running responder. Dropping it does not stop the responder;
/// call [`DiscoveryHandle::shutdown`].
pub struct DiscoveryHandle {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl DiscoveryHandle {
    /// Address the responder is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop answering and close the socket.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "discovery task ended abnormally");
        }
    }
}

impl DiscoveryResponder {
    /// Bind the discovery socket.
    pub async fn bind(config: DiscoveryConfig) -> DiscoveryResult<Self> {
        let socket = UdpSocket::bind(config.bind)
            .await
            .map_err(|source| DiscoveryError::Bind {
                port: config.bind.port(),
                source,
            })?;
        socket.set_broadcast(true)?;

        Ok(Self {
            socket: Arc::new(socket),
            config: Arc::new(config),
            replies: Arc::new(Semaphore::new(MAX_IN_FLIGHT_REPLIES)),
        })
    }

    pub fn local_addr(&self) -> DiscoveryResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Run the responder on its own task.
    pub fn spawn(self) -> DiscoveryResult<DiscoveryHandle> {
        let local_addr = self.local_addr()?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(self.run(shutdown_rx));
        Ok(DiscoveryHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }

    /// Answer queries until a shutdown signal arrives.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            addr = %self.socket.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "network discovery started"
        );
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => self.handle_datagram(&buf[..len], peer),
                        // e.g. ICMP port unreachable surfacing on some platforms
                        Err(e) => debug!(error = %e, "discovery receive failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("network discovery stopped");
                    break;
                }
            }
        }
    }

    fn handle_datagram(&self, payload: &[u8], peer: SocketAddr) {
        if payload != DISCOVERY_TOKEN {
            trace!(%peer, len = payload.len(), "ignoring unrecognized datagram");
            return;
        }

        let Ok(permit) = Arc::clone(&self.replies).try_acquire_owned() else {
            debug!(%peer, "too many pending discovery replies, dropping query");
            return;
        };

        let socket = Arc::clone(&self.socket);
        let config = Arc::clone(&self.config);
        tokio::spawn(async move {
            let _permit = permit;
            let announcement = config.announcement_for(peer).await;
            let payload = match serde_json::to_vec(&announcement) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "failed to encode discovery announcement");
                    return;
                }
            };
            match socket.send_to(&payload, peer).await {
                Ok(_) => debug!(%peer, "discovery response sent"),
                Err(e) => debug!(%peer, error = %e, "discovery response failed"),
            }
        });
    }
}

/// Send a discovery query to `target` and collect every announcement that
/// arrives within `wait`.
///
/// `target` is usually the broadcast address on the discovery port. Replies
/// that do not parse are ignored.
pub async fn probe(target: SocketAddr, wait: Duration) -> DiscoveryResult<Vec<(SocketAddr, DiscoveryAnnouncement)>> {
    let bind: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.set_broadcast(true)?;
    socket.send_to(DISCOVERY_TOKEN, target).await?;

    let mut found = Vec::new();
    let mut buf = [0u8; 2048];
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Err(e)) => {
                debug!(error = %e, "discovery probe receive failed");
                continue;
            }
            Ok(Ok((len, from))) => match serde_json::from_slice(&buf[..len]) {
                Ok(announcement) => found.push((from, announcement)),
                Err(e) => debug!(%from, error = %e, "ignoring malformed discovery reply"),
            },
        }
    }
    Ok(found)
}

/// Broadcast target for [`probe`] on the given port.
pub fn broadcast_target(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::BROADCAST, port))
}
