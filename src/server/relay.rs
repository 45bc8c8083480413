//! Per-connection proxy worker: bidirectional byte relay with handshake
//! inspection.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;

use super::blocklist::client_ip_key;
use super::inspector::HandshakeInspector;
use super::listener::RouteState;
use crate::abac::{AbacDecision, ConnectionRegistry};
use crate::protocol::mysql::packets::ErrPacket;
use crate::protocol::mysql::parser::{build_err_packet, write_packet};

/// Why a relay ended and how much data moved in each direction.
#[derive(Debug)]
pub struct RelayOutcome {
    /// Bytes forwarded server -> client
    pub bytes_up: u64,
    /// Bytes forwarded client -> server
    pub bytes_down: u64,
    /// Whether the handshake phase completed before the relay ended
    pub handshake_done: bool,
    /// Human-readable end reason for the session log
    pub detail: String,
}

enum Event {
    FromServer(std::io::Result<usize>),
    FromClient(std::io::Result<usize>),
    Revoked,
}

async fn wait_revoked(revoke: Option<&Notify>) {
    match revoke {
        Some(revoke) => revoke.notified().await,
        None => std::future::pending().await,
    }
}

async fn next_event<C, S>(
    client: &mut C,
    server: &mut S,
    client_buf: &mut [u8],
    server_buf: &mut [u8],
    revoke: Option<&Notify>,
) -> Event
where
    C: AsyncRead + Unpin,
    S: AsyncRead + Unpin,
{
    tokio::select! {
        result = server.read(server_buf) => Event::FromServer(result),
        result = client.read(client_buf) => Event::FromClient(result),
        _ = wait_revoked(revoke) => Event::Revoked,
    }
}

async fn forward<W: AsyncWrite + Unpin>(writer: &mut W, buf: &[u8]) -> std::io::Result<()> {
    writer.write_all(buf).await?;
    writer.flush().await
}

/// Shovel bytes between a client and its upstream until either side closes,
/// the handshake times out, inspection fails, or admission is revoked.
///
/// While the handshake is pending every wait is bounded by
/// `handshake_timeout` and each forwarded buffer passes through the
/// inspector; once the handshake completes the relay waits indefinitely and
/// forwards without inspection.
pub async fn relay<C, S>(
    client: &mut C,
    server: &mut S,
    inspector: &mut HandshakeInspector,
    net_buffer_length: usize,
    handshake_timeout: Duration,
    revoke: Option<Arc<Notify>>,
) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = vec![0u8; net_buffer_length];
    let mut server_buf = vec![0u8; net_buffer_length];
    let mut bytes_up = 0u64;
    let mut bytes_down = 0u64;

    let detail = loop {
        let revoke_ref = revoke.as_deref();
        let event = if inspector.handshake_done() {
            next_event(client, server, &mut client_buf, &mut server_buf, revoke_ref).await
        } else {
            match timeout(
                handshake_timeout,
                next_event(client, server, &mut client_buf, &mut server_buf, revoke_ref),
            )
            .await
            {
                Ok(event) => event,
                Err(_) => break "Select timed out".to_string(),
            }
        };

        match event {
            Event::FromServer(Ok(0)) => break "server closed connection".to_string(),
            Event::FromServer(Ok(n)) => {
                if !inspector.handshake_done() {
                    if let Err(e) = inspector.inspect(&server_buf[..n]) {
                        break e.to_string();
                    }
                }
                if let Err(e) = forward(client, &server_buf[..n]).await {
                    break format!("Copy server-client failed: {}", e);
                }
                bytes_up += n as u64;
            }
            Event::FromClient(Ok(0)) => break "client closed connection".to_string(),
            Event::FromClient(Ok(n)) => {
                if !inspector.handshake_done() {
                    if let Err(e) = inspector.inspect(&client_buf[..n]) {
                        break e.to_string();
                    }
                }
                if let Err(e) = forward(server, &client_buf[..n]).await {
                    break format!("Copy client-server failed: {}", e);
                }
                bytes_down += n as u64;
            }
            Event::FromServer(Err(e)) => break format!("server read failed: {}", e),
            Event::FromClient(Err(e)) => break format!("client read failed: {}", e),
            Event::Revoked => break "connection revoked by policy".to_string(),
        }
    };

    RelayOutcome {
        bytes_up,
        bytes_down,
        handshake_done: inspector.handshake_done(),
        detail,
    }
}

/// Serve one accepted client: dial upstream, run the admission check, relay
/// traffic, and tear everything down.
pub(crate) async fn run_session(
    state: Arc<RouteState>,
    mut client: TcpStream,
    client_addr: SocketAddr,
) {
    let name = state.config.name.as_str();

    let mut server = match state
        .destinations
        .get_server_socket(Duration::from_secs(state.config.connect_timeout as u64))
        .await
    {
        Ok(server) => server,
        Err(e) => {
            warn!("[{}] Can't connect to MySQL server: {}", name, e);
            let err = ErrPacket::cannot_connect();
            if let Err(e) = write_packet(&mut client, 0, &build_err_packet(&err)).await {
                debug!("[{}] write error: {}", name, e);
            }
            let _ = client.shutdown().await;
            return;
        }
    };

    let client_ip = client_addr.ip().to_string();
    let client_port = client_addr.port();

    debug!("[{}] connection established, checking policy", name);
    // A policy client that cannot be rebuilt leaves no basis for an
    // admission decision, so the connection is refused like a denial.
    let decision = match state.abac.check(&client_ip, client_port).await {
        Ok(decision) => decision,
        Err(e) => {
            error!("[{}] {}", name, e);
            AbacDecision::Deny
        }
    };
    if decision == AbacDecision::Deny {
        let bind = &state.config.bind_address;
        let message = format!(
            "Can't connect to remote MySQL server for client '{}:{}', ABAC check failure.",
            bind.host, bind.port
        );
        warn!("[{}] {}", name, message);
        let err = ErrPacket::new(2003, message);
        if let Err(e) = write_packet(&mut client, 0, &build_err_packet(&err)).await {
            debug!("[{}] write error: {}", name, e);
        }
        let _ = client.shutdown().await;
        let _ = server.shutdown().await;
        return;
    }

    let registration = state
        .abac
        .enabled()
        .then(|| ConnectionRegistry::register(&state.registry, client_ip.clone(), client_port));
    let revoke = registration.as_ref().map(|r| r.revoke_handle());

    if let Ok(server_addr) = server.peer_addr() {
        debug!(
            "[{}] [{}]:{} - [{}]:{}",
            name,
            client_ip,
            client_port,
            server_addr.ip(),
            server_addr.port()
        );
    }
    state
        .stats
        .connections_handled
        .fetch_add(1, Ordering::Relaxed);

    let mut inspector = HandshakeInspector::new();
    let outcome = relay(
        &mut client,
        &mut server,
        &mut inspector,
        state.config.net_buffer_length as usize,
        Duration::from_secs(state.config.client_connect_timeout as u64),
        revoke,
    )
    .await;

    if !outcome.handshake_done {
        debug!(
            "[{}] Routing failed for {}: {}",
            name, client_ip, outcome.detail
        );
        state
            .block_list
            .register_failure(
                name,
                client_ip_key(client_addr.ip()),
                &client_ip,
                Some(&mut server),
            )
            .await;
    }

    drop(registration);
    let _ = client.shutdown().await;
    let _ = server.shutdown().await;

    debug!(
        "[{}] Routing stopped (up:{}b;down:{}b) {}",
        name, outcome.bytes_up, outcome.bytes_down, outcome.detail
    );
}
