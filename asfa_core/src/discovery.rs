//! LAN peer discovery over UDP multicast.
//!
//! A running server announces `asfa!<username>!<ip>!<port>` every few seconds;
//! listeners turn valid announcements into `PeerDiscovered` events. Nothing is
//! deduplicated or expired here, consumers keep the latest entry per username.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::AppEvent;
use crate::config::DiscoveryConfig;

/// First field of every announcement, filters out foreign traffic
pub const DISCOVERY_TAG: &str = "asfa";
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 1, 1, 3);
pub const DISCOVERY_PORT: u16 = 12001;
pub const MULTICAST_TTL: u32 = 2;
pub const DISCOVERY_INTERVAL_SECS: u64 = 3;

const MAX_DATAGRAM: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub username: String,
    pub addr: SocketAddr,
}

/// Drop the field separator so a name can't shift the other fields
fn clean_username(username: &str) -> String {
    username.replace('!', "")
}

impl PeerIdentity {
    pub fn new(username: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            username: clean_username(&username.into()),
            addr,
        }
    }

    pub fn to_payload(&self) -> String {
        format!(
            "{}!{}!{}!{}",
            DISCOVERY_TAG,
            clean_username(&self.username),
            self.addr.ip(),
            self.addr.port()
        )
    }

    /// Parse an announcement. Anything but exactly four `!`-separated fields
    /// starting with the tag, with a valid IP and port, is rejected.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(payload).ok()?;
        let fields: Vec<&str> = text.split('!').collect();
        let [tag, username, ip, port] = fields.as_slice() else {
            return None;
        };
        if *tag != DISCOVERY_TAG {
            return None;
        }
        let ip: IpAddr = ip.trim().parse().ok()?;
        let port: u16 = port.trim().parse().ok()?;
        Some(Self::new(*username, SocketAddr::new(ip, port)))
    }
}

/// Periodic announcer; stops when `stop` is called or the beacon is dropped.
pub struct DiscoveryBeacon {
    guard: DropGuard,
    task: JoinHandle<()>,
}

impl DiscoveryBeacon {
    pub async fn start(identity: PeerIdentity, config: &DiscoveryConfig) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .context("Failed to bind discovery socket")?;
        socket
            .set_multicast_ttl_v4(config.ttl)
            .context("Failed to set multicast TTL")?;

        let target = SocketAddr::from((config.group, config.port));
        let period = Duration::from_secs(config.interval_secs.max(1));
        let payload = identity.to_payload();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        // Best effort, the next tick tries again
                        if let Err(e) = socket.send_to(payload.as_bytes(), target).await {
                            debug!("Discovery announce to {} failed: {}", target, e);
                        }
                    }
                }
            }
        });

        info!(
            "Announcing '{}' at {} on {}",
            identity.username, identity.addr, target
        );
        Ok(Self {
            guard: cancel.drop_guard(),
            task,
        })
    }

    pub async fn stop(self) {
        drop(self.guard);
        let _ = self.task.await;
        debug!("Discovery beacon stopped");
    }
}

pub struct DiscoveryListener {
    socket: UdpSocket,
}

impl DiscoveryListener {
    /// Bind the discovery port (shared with other listeners on this host) and
    /// join the multicast group. Must be called inside a tokio runtime.
    pub fn bind(config: &DiscoveryConfig) -> anyhow::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        socket
            .bind(&addr.into())
            .with_context(|| format!("Failed to bind discovery port {}", config.port))?;

        let socket = UdpSocket::from_std(socket.into())?;
        if config.group.is_multicast() {
            if let Err(e) = socket.join_multicast_v4(config.group, Ipv4Addr::UNSPECIFIED) {
                warn!("Could not join multicast group {}: {}", config.group, e);
            }
        }
        Ok(Self { socket })
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Start listening loop
    pub fn start_listening(
        self,
        event_tx: mpsc::Sender<AppEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = self.socket.recv_from(&mut buf) => received,
                };
                match received {
                    Ok((len, from)) => {
                        let Some(peer) = PeerIdentity::parse(&buf[..len]) else {
                            debug!(%from, "Ignoring malformed discovery payload");
                            continue;
                        };
                        debug!(%from, "Peer '{}' at {}", peer.username, peer.addr);
                        let event = AppEvent::PeerDiscovered {
                            username: peer.username,
                            addr: peer.addr,
                        };
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Discovery listener stopped: {}", e);
                        break;
                    }
                }
            }
        })
    }
}
