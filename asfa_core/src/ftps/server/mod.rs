//! Read-only FTPS server sharing per-user root directories.
//!
//! TLS is mandatory on the control and data channels. The user table and the
//! bandwidth limit are shared with every session; sessions read them when they
//! log in or open a data connection, so changes apply to new work only.

mod auth;
mod data;
mod path;
mod session;
mod throttle;

pub use auth::{AuthFailure, AuthorizeError, Authorizer};
pub use session::SERVER_BANNER;
pub use throttle::Throttle;

use anyhow::Context;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::session::SessionContext;
use super::tls;
use crate::config::{AppConfig, DiscoveryConfig};
use crate::discovery::{DiscoveryBeacon, PeerIdentity};
use crate::identity::local_lan_ip;

pub struct TransferServer {
    authorizer: Authorizer,
    bandwidth: Arc<AtomicU64>,
    discovery: DiscoveryConfig,
    running: Option<RunningServer>,
}

struct RunningServer {
    identity: PeerIdentity,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
    beacon: Option<DiscoveryBeacon>,
}

impl TransferServer {
    pub fn new(bandwidth_limit: u64, hash_passwords: bool, discovery: DiscoveryConfig) -> Self {
        Self {
            authorizer: Authorizer::new(hash_passwords),
            bandwidth: Arc::new(AtomicU64::new(bandwidth_limit)),
            discovery,
            running: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.bandwidth_limit,
            config.hash_passwords,
            config.discovery.clone(),
        )
    }

    /// Share `root` with `username`. Effective for the next login.
    pub fn authorize(
        &self,
        username: &str,
        password: &str,
        root: &Path,
    ) -> Result<(), AuthorizeError> {
        self.authorizer.add_user(username, password, root)?;
        info!("Authorized '{}' on {:?}", username, root);
        Ok(())
    }

    /// Sessions already logged in as `username` keep working
    pub fn revoke(&self, username: &str) -> bool {
        let removed = self.authorizer.remove_user(username);
        if removed {
            info!("Revoked '{}'", username);
        }
        removed
    }

    pub fn authorized_users(&self) -> Vec<String> {
        self.authorizer.usernames()
    }

    /// Bytes per second for data connections opened from now on, 0 = unlimited
    pub fn set_bandwidth_limit(&self, bytes_per_sec: u64) {
        self.bandwidth.store(bytes_per_sec, Ordering::Relaxed);
        debug!("Bandwidth limit set to {} B/s", bytes_per_sec);
    }

    pub fn bandwidth_limit(&self) -> u64 {
        self.bandwidth.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Identity announced by the beacon while the server runs
    pub fn identity(&self) -> Option<&PeerIdentity> {
        self.running.as_ref().map(|r| &r.identity)
    }

    /// Bind `bind`, start serving and announce `username` on the LAN.
    ///
    /// A wildcard bind address is announced as the machine's LAN IP. A
    /// running server is stopped first.
    pub async fn start(&mut self, username: &str, bind: SocketAddr) -> anyhow::Result<PeerIdentity> {
        self.stop().await;

        let acceptor = tls::make_acceptor().context("Failed to build TLS config")?;
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("Failed to bind {}", bind))?;
        let local_addr = listener.local_addr()?;

        let announced_ip = if bind.ip().is_unspecified() {
            local_lan_ip()
        } else {
            bind.ip()
        };
        let identity = PeerIdentity::new(username, SocketAddr::new(announced_ip, local_addr.port()));

        let ctx = Arc::new(SessionContext {
            acceptor,
            authorizer: self.authorizer.clone(),
            bandwidth: self.bandwidth.clone(),
        });
        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(listener, ctx, shutdown.clone()));

        let beacon = match DiscoveryBeacon::start(identity.clone(), &self.discovery).await {
            Ok(beacon) => Some(beacon),
            Err(e) => {
                warn!("Discovery beacon not started: {:#}", e);
                None
            }
        };

        info!("Server running on '{}'", identity.addr);
        self.running = Some(RunningServer {
            identity: identity.clone(),
            shutdown,
            accept_task,
            beacon,
        });
        Ok(identity)
    }

    /// Close the listener and every session, then stop announcing.
    /// Returns false if the server was not running.
    pub async fn stop(&mut self) -> bool {
        let Some(running) = self.running.take() else {
            return false;
        };
        running.shutdown.cancel();
        let _ = running.accept_task.await;
        if let Some(beacon) = running.beacon {
            beacon.stop().await;
        }
        info!("Server stopped");
        true
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<SessionContext>, shutdown: CancellationToken) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Control connection accepted");
                    sessions.spawn(session::run(stream, peer, ctx.clone(), shutdown.child_token()));
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }
    drop(listener);
    while sessions.join_next().await.is_some() {}
}
