//! TCP listener and admission control for one route.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::broadcast;

use super::blocklist::{client_ip_key, ClientBlockList};
use super::destination::Destinations;
use super::relay::run_session;
use crate::abac::{spawn_revalidation_task, AbacClient, ConnectionRegistry};
use crate::config::{RouteConfig, TcpAddress};
use crate::error::{Result, RoutingError};
use crate::protocol::mysql::packets::ErrPacket;
use crate::protocol::mysql::parser::{build_err_packet, write_packet};

/// Listen backlog of the route's server socket
const LISTEN_BACKLOG: u32 = 20;

/// Router statistics
#[derive(Debug, Default)]
pub struct RouterStats {
    /// Total connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Connections refused at admission
    pub connections_rejected: AtomicU64,
    /// Connections that reached the relay stage
    pub connections_handled: AtomicU64,
}

/// Everything a route's workers share.
#[derive(Debug)]
pub(crate) struct RouteState {
    pub(crate) config: RouteConfig,
    pub(crate) destinations: Destinations,
    pub(crate) block_list: ClientBlockList,
    pub(crate) abac: Arc<AbacClient>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) stats: Arc<RouterStats>,
}

/// One configured route: a listening socket, its destination set, and the
/// admission machinery in front of the per-connection relays.
#[derive(Debug)]
pub struct Router {
    listener: TcpListener,
    state: Arc<RouteState>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Router {
    /// Build the route components and bind its server socket.
    pub async fn bind(config: RouteConfig, shutdown_rx: broadcast::Receiver<()>) -> Result<Self> {
        let destinations = if config.destinations.contains("://") {
            Destinations::from_uri(&config.destinations)?
        } else {
            Destinations::from_csv(&config.destinations, config.mode, &config.bind_address)?
        };
        let abac = Arc::new(AbacClient::new(&config.abac)?);
        let listener = setup_listener(&config.bind_address).await?;

        Ok(Self {
            listener,
            state: Arc::new(RouteState {
                block_list: ClientBlockList::new(config.max_connect_errors),
                destinations,
                abac,
                registry: Arc::new(ConnectionRegistry::new()),
                stats: Arc::new(RouterStats::default()),
                config,
            }),
            shutdown_rx,
        })
    }

    /// Route statistics
    pub fn stats(&self) -> Arc<RouterStats> {
        Arc::clone(&self.state.stats)
    }

    /// A copy of the blocked client addresses (16-byte form)
    pub fn blocked_client_hosts(&self) -> Vec<[u8; 16]> {
        self.state.block_list.blocked_client_hosts()
    }

    /// The address the route is actually listening on.
    ///
    /// Useful when binding to port 0 to get an OS-assigned port.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop until the shutdown signal arrives.
    ///
    /// In-flight sessions are not interrupted by shutdown; they end when
    /// either side closes (or when a revalidation pass revokes them).
    pub async fn run(mut self) -> Result<()> {
        let state = Arc::clone(&self.state);
        info!(
            "[{}] listening on {}; {}",
            state.config.name,
            state.config.bind_address,
            state.config.mode.name()
        );

        let _revalidation = spawn_revalidation_task(
            Arc::clone(&state.registry),
            Arc::clone(&state.abac),
            self.shutdown_rx.resubscribe(),
        );

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.admit(stream, addr).await,
                        Err(e) => {
                            error!("[{}] Failed opening client socket: {}", state.config.name, e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("[{}] stopped", state.config.name);
                    break;
                }
            }
        }

        info!(
            "[{}] total: {}, active: {}, rejected: {}",
            state.config.name,
            state.stats.connections_accepted.load(Ordering::Relaxed),
            state.stats.connections_active.load(Ordering::Relaxed),
            state.stats.connections_rejected.load(Ordering::Relaxed)
        );

        Ok(())
    }

    /// Admission checks for one accepted client; spawns the relay worker
    /// when they pass.
    async fn admit(&self, mut stream: TcpStream, addr: SocketAddr) {
        let state = &self.state;
        let name = state.config.name.as_str();
        let key = client_ip_key(addr.ip());

        if state.block_list.is_blocked(&key) {
            let err = ErrPacket::blocked_client(&addr.ip().to_string());
            if let Err(e) = write_packet(&mut stream, 0, &build_err_packet(&err)).await {
                debug!("[{}] write error: {}", name, e);
            }
            state.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
            // Closed on drop, without a prior shutdown
            return;
        }

        if state.stats.connections_active.load(Ordering::Relaxed)
            >= state.config.max_connections as u64
        {
            let err = ErrPacket::too_many_connections();
            if let Err(e) = write_packet(&mut stream, 0, &build_err_packet(&err)).await {
                debug!("[{}] write error: {}", name, e);
            }
            warn!(
                "[{}] reached max active connections ({})",
                name, state.config.max_connections
            );
            state.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            error!("[{}] client setsockopt error: {}", name, e);
            return;
        }

        state.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        state.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        debug!("[{}] accepted connection from {}", name, addr);

        let state = Arc::clone(state);
        tokio::spawn(async move {
            run_session(Arc::clone(&state), stream, addr).await;
            state.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            debug!("[{}] connection from {} closed", state.config.name, addr);
        });
    }
}

async fn setup_listener(bind_address: &TcpAddress) -> Result<TcpListener> {
    let context = |e: std::io::Error| {
        RoutingError::Connection(format!("Setting up service using {}: {}", bind_address, e))
    };

    let mut resolved = lookup_host((bind_address.host.as_str(), bind_address.port))
        .await
        .map_err(context)?;
    let addr = resolved.next().ok_or_else(|| {
        RoutingError::Connection(format!(
            "Setting up service using {}: address did not resolve",
            bind_address
        ))
    })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(context)?;
    socket.set_reuseaddr(true).map_err(context)?;
    socket.bind(addr).map_err(context)?;
    socket.listen(LISTEN_BACKLOG).map_err(context)
}
