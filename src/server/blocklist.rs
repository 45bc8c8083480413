//! Per-client authentication-error counters and the blocked-host list.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use tokio::io::AsyncWrite;

use crate::protocol::mysql::packets::{
    HandshakeResponse41, CLIENT_CONNECT_WITH_DB, CLIENT_PROTOCOL_41, CLIENT_SECURE_CONNECTION,
};
use crate::protocol::mysql::parser::{build_handshake_response41, write_packet};

/// The 16-byte counter key for a client address (IPv4 mapped into IPv6).
pub fn client_ip_key(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

#[derive(Default)]
#[derive(Debug)]
struct Counters {
    auth_errors: HashMap<[u8; 16], u32>,
    blocked: Vec<[u8; 16]>,
}

/// Tracks handshake failures per client address and blocks repeat offenders.
///
/// All methods serialize on a single mutex; the critical sections are brief
/// and never held across socket writes.
#[derive(Debug)]
pub struct ClientBlockList {
    max_connect_errors: u32,
    counters: Mutex<Counters>,
}

impl ClientBlockList {
    /// Create a block list with the given failure threshold
    pub fn new(max_connect_errors: u32) -> Self {
        Self {
            max_connect_errors,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Record a handshake failure for a client address.
    ///
    /// Returns true when the address has reached the threshold and is now
    /// blocked. When `server` carries the upstream stream of the failed
    /// session, a fabricated handshake response is written into it so the
    /// backend sees a completed login attempt and closes cleanly; write
    /// errors are logged and swallowed.
    pub async fn register_failure<W>(
        &self,
        route: &str,
        client_ip: [u8; 16],
        client_ip_str: &str,
        server: Option<&mut W>,
    ) -> bool
    where
        W: AsyncWrite + Unpin,
    {
        let blocked = {
            let mut counters = self.counters.lock().unwrap();
            let count = counters.auth_errors.entry(client_ip).or_insert(0);
            *count += 1;
            let count = *count;
            if count >= self.max_connect_errors {
                if !counters.blocked.contains(&client_ip) {
                    counters.blocked.push(client_ip);
                }
                warn!("[{}] blocking client host {}", route, client_ip_str);
                true
            } else {
                info!(
                    "[{}] {} authentication errors for {} (max {})",
                    route, count, client_ip_str, self.max_connect_errors
                );
                false
            }
        };

        if let Some(server) = server {
            let payload = build_handshake_response41(&fake_login_response());
            if let Err(e) = write_packet(server, 1, &payload).await {
                debug!("[{}] write error: {}", route, e);
            }
        }

        blocked
    }

    /// Whether a client address has reached the failure threshold
    pub fn is_blocked(&self, client_ip: &[u8; 16]) -> bool {
        let counters = self.counters.lock().unwrap();
        counters
            .auth_errors
            .get(client_ip)
            .is_some_and(|count| *count >= self.max_connect_errors)
    }

    /// A copy of the blocked client addresses, in blocking order
    pub fn blocked_client_hosts(&self) -> Vec<[u8; 16]> {
        self.counters.lock().unwrap().blocked.clone()
    }
}

/// The handshake response written to an upstream whose client never finished
/// authenticating. The username and auth data are fixed markers so the
/// attempt is recognizable in backend logs.
pub fn fake_login_response() -> HandshakeResponse41 {
    HandshakeResponse41 {
        capability_flags: CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_CONNECT_WITH_DB,
        username: "ROUTER".to_string(),
        auth_response: b"fake_router_login".to_vec(),
        database: Some(String::new()),
        ..Default::default()
    }
}
