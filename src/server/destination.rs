//! Destination selection for upstream connections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::config::{split_host_port, AccessMode, TcpAddress};
use crate::error::{Result, RoutingError};

/// Port assumed for destinations that do not name one
const DEFAULT_DESTINATION_PORT: u16 = 3306;

/// How long a destination that failed to dial is skipped in
/// first-available mode.
const QUARANTINE_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum SelectionPolicy {
    /// Round-robin across the list; the cursor advances past each winner
    RoundRobin { next: AtomicUsize },
    /// Always start from the head; failed entries cool down before retry
    FirstAvailable { quarantined_until: Mutex<Vec<Option<Instant>>> },
}

/// The ordered destination set of a route and its selection policy.
///
/// The set is built once from configuration and never changes afterwards.
#[derive(Debug)]
pub struct Destinations {
    addrs: Vec<TcpAddress>,
    policy: SelectionPolicy,
}

impl Destinations {
    /// Build the destination set from a comma-separated `host[:port]` list.
    ///
    /// A missing or zero port falls back to 3306. The route's own bind
    /// address may not appear in the list.
    pub fn from_csv(csv: &str, mode: AccessMode, bind_address: &TcpAddress) -> Result<Self> {
        let mut addrs = Vec::new();
        for part in csv.split(',') {
            let (host, port) = split_host_port(part).map_err(|_| {
                RoutingError::Config(format!("Destination address '{}' is invalid", part.trim()))
            })?;
            if host.is_empty() {
                return Err(RoutingError::Config(format!(
                    "Destination address '{}' is invalid",
                    part.trim()
                )));
            }
            let port = if port == 0 {
                DEFAULT_DESTINATION_PORT
            } else {
                port
            };
            addrs.push(TcpAddress::new(host, port));
        }

        if addrs.iter().any(|addr| addr == bind_address) {
            return Err(RoutingError::Config(
                "Bind Address can not be part of destinations".to_string(),
            ));
        }
        if addrs.is_empty() {
            return Err(RoutingError::Config("No destinations available".to_string()));
        }

        Ok(Self::with_policy(addrs, mode))
    }

    /// Build the destination set from a `fabric+cache://<cache>/group` URI.
    ///
    /// The URI grammar is validated here; the metadata cache itself is an
    /// external collaborator, and a standalone router has none registered,
    /// so a well-formed group URI reports the named cache as unavailable.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let parsed = Url::parse(uri)
            .map_err(|e| RoutingError::Config(format!("invalid destinations URI '{}': {}", uri, e)))?;

        if parsed.scheme() != "fabric+cache" {
            return Err(RoutingError::Config(format!(
                "Invalid URI scheme '{}' for URI {}",
                parsed.scheme(),
                uri
            )));
        }

        let command = parsed
            .path_segments()
            .and_then(|mut segments| segments.next())
            .unwrap_or("")
            .to_ascii_lowercase();
        if command != "group" {
            return Err(RoutingError::Config(format!(
                "Invalid Fabric command in URI; was '{}'",
                command
            )));
        }

        Err(RoutingError::Config(format!(
            "Invalid Fabric Cache in URI; was '{}'",
            parsed.host_str().unwrap_or("")
        )))
    }

    fn with_policy(addrs: Vec<TcpAddress>, mode: AccessMode) -> Self {
        let policy = match mode {
            AccessMode::ReadOnly => SelectionPolicy::RoundRobin {
                next: AtomicUsize::new(0),
            },
            AccessMode::ReadWrite => SelectionPolicy::FirstAvailable {
                quarantined_until: Mutex::new(vec![None; addrs.len()]),
            },
        };
        Self { addrs, policy }
    }

    /// Number of configured destinations
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Whether the set is empty (never true after configuration parsing)
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// The configured addresses, in order
    pub fn addresses(&self) -> &[TcpAddress] {
        &self.addrs
    }

    /// Dial the next destination according to the selection policy.
    ///
    /// Individual dial failures are logged; only after the whole set has
    /// been tried does `NoReachableDestination` surface.
    pub async fn get_server_socket(&self, connect_timeout: Duration) -> Result<TcpStream> {
        match &self.policy {
            SelectionPolicy::RoundRobin { next } => {
                let count = self.addrs.len();
                let start = next.load(Ordering::Relaxed);
                for offset in 0..count {
                    let idx = (start + offset) % count;
                    let addr = &self.addrs[idx];
                    match dial(addr, connect_timeout).await {
                        Ok(stream) => {
                            next.store((idx + 1) % count, Ordering::Relaxed);
                            return Ok(stream);
                        }
                        Err(e) => warn!("connecting to destination {} failed: {}", addr, e),
                    }
                }
                Err(RoutingError::NoReachableDestination)
            }
            SelectionPolicy::FirstAvailable { quarantined_until } => {
                for (idx, addr) in self.addrs.iter().enumerate() {
                    {
                        let quarantine = quarantined_until.lock().unwrap();
                        if let Some(until) = quarantine[idx] {
                            if Instant::now() < until {
                                debug!("skipping quarantined destination {}", addr);
                                continue;
                            }
                        }
                    }
                    match dial(addr, connect_timeout).await {
                        Ok(stream) => {
                            quarantined_until.lock().unwrap()[idx] = None;
                            return Ok(stream);
                        }
                        Err(e) => {
                            warn!("connecting to destination {} failed: {}", addr, e);
                            quarantined_until.lock().unwrap()[idx] =
                                Some(Instant::now() + QUARANTINE_COOLDOWN);
                        }
                    }
                }
                Err(RoutingError::NoReachableDestination)
            }
        }
    }
}

async fn dial(addr: &TcpAddress, connect_timeout: Duration) -> std::io::Result<TcpStream> {
    match timeout(
        connect_timeout,
        TcpStream::connect((addr.host.as_str(), addr.port)),
    )
    .await
    {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connect timed out",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn bind_addr() -> TcpAddress {
        TcpAddress::new("127.0.0.1", 7001)
    }

    async fn counting_listener() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_ok() {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        (addr, accepted)
    }

    /// Bind and immediately drop a listener so the port refuses connections.
    async fn dead_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_from_csv_default_port() {
        let dest =
            Destinations::from_csv("10.0.10.5,10.0.11.6:3307", AccessMode::ReadOnly, &bind_addr())
                .unwrap();
        assert_eq!(
            dest.addresses(),
            &[
                TcpAddress::new("10.0.10.5", 3306),
                TcpAddress::new("10.0.11.6", 3307)
            ]
        );
    }

    #[test]
    fn test_from_csv_port_zero_replaced() {
        let dest = Destinations::from_csv("10.0.10.5:0", AccessMode::ReadOnly, &bind_addr()).unwrap();
        assert_eq!(dest.addresses()[0].port, 3306);
    }

    #[test]
    fn test_from_csv_rejects_invalid_entry() {
        let err = Destinations::from_csv(
            "10.0.10.5,host:notaport",
            AccessMode::ReadOnly,
            &bind_addr(),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Destination address 'host:notaport' is invalid"
        );
    }

    #[test]
    fn test_from_csv_rejects_bind_address() {
        let err = Destinations::from_csv(
            "10.0.10.5,127.0.0.1:7001",
            AccessMode::ReadOnly,
            &bind_addr(),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Bind Address can not be part of destinations"
        );
    }

    #[test]
    fn test_from_csv_rejects_empty_list() {
        let err = Destinations::from_csv("", AccessMode::ReadOnly, &bind_addr()).unwrap_err();
        assert!(err.to_string().contains("invalid"));
    }

    #[test]
    fn test_from_uri_wrong_scheme() {
        let err = Destinations::from_uri("mysql://server/group").unwrap_err();
        assert!(err.to_string().contains("Invalid URI scheme 'mysql'"));
    }

    #[test]
    fn test_from_uri_wrong_command() {
        let err = Destinations::from_uri("fabric+cache://mycache/shard").unwrap_err();
        assert_eq!(err.to_string(), "Invalid Fabric command in URI; was 'shard'");
    }

    #[test]
    fn test_from_uri_group_without_cache() {
        let err = Destinations::from_uri("fabric+cache://mycache/group").unwrap_err();
        assert_eq!(err.to_string(), "Invalid Fabric Cache in URI; was 'mycache'");
    }

    #[tokio::test]
    async fn test_round_robin_visits_distinct_destinations() {
        let (addr_a, count_a) = counting_listener().await;
        let (addr_b, count_b) = counting_listener().await;
        let (addr_c, count_c) = counting_listener().await;

        let csv = format!(
            "127.0.0.1:{},127.0.0.1:{},127.0.0.1:{}",
            addr_a.port(),
            addr_b.port(),
            addr_c.port()
        );
        let dest = Destinations::from_csv(&csv, AccessMode::ReadOnly, &bind_addr()).unwrap();

        for _ in 0..3 {
            dest.get_server_socket(Duration::from_secs(1)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
        assert_eq!(count_c.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_round_robin_skips_dead_destination() {
        let dead = dead_port().await;
        let (live, live_count) = counting_listener().await;

        let csv = format!("127.0.0.1:{},127.0.0.1:{}", dead, live.port());
        let dest = Destinations::from_csv(&csv, AccessMode::ReadOnly, &bind_addr()).unwrap();

        dest.get_server_socket(Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(live_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_available_prefers_head_and_quarantines_failures() {
        let dead = dead_port().await;
        let (live, live_count) = counting_listener().await;

        let csv = format!("127.0.0.1:{},127.0.0.1:{}", dead, live.port());
        let dest = Destinations::from_csv(&csv, AccessMode::ReadWrite, &bind_addr()).unwrap();

        // First call fails over to the live destination and quarantines the head
        dest.get_server_socket(Duration::from_secs(1)).await.unwrap();
        // Second call must go straight to the live destination
        dest.get_server_socket(Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(live_count.load(Ordering::SeqCst), 2);

        match &dest.policy {
            SelectionPolicy::FirstAvailable { quarantined_until } => {
                assert!(quarantined_until.lock().unwrap()[0].is_some());
            }
            _ => panic!("expected first-available policy"),
        }
    }

    #[tokio::test]
    async fn test_all_unreachable_reports_no_destination() {
        let dead_a = dead_port().await;
        let dead_b = dead_port().await;

        let csv = format!("127.0.0.1:{},127.0.0.1:{}", dead_a, dead_b);
        let dest = Destinations::from_csv(&csv, AccessMode::ReadOnly, &bind_addr()).unwrap();

        let err = dest
            .get_server_socket(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::NoReachableDestination));
    }
}
