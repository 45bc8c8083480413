//! HTTP client for the external policy service.

use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;

use crate::config::AbacConfig;
use crate::error::{Result, RoutingError};

/// Timeout for establishing the TCP connection to the policy service
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for a whole policy request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a policy check for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbacDecision {
    /// The connection may proceed
    Allow,
    /// The connection must be refused
    Deny,
}

/// Client for the attestation-based access control service.
///
/// One instance per route. The HTTP handle is serialized behind a mutex and
/// rebuilt in place whenever a request fails at the transport level; the
/// failed check itself is answered with `Deny`.
#[derive(Debug)]
pub struct AbacClient {
    enabled: bool,
    url: String,
    id: String,
    principal_id: String,
    test_override: Option<(String, u16)>,
    http: Mutex<reqwest::Client>,
}

impl AbacClient {
    /// Construct the client for a route.
    ///
    /// Fails with `FatalInit` when the HTTP handle cannot be built at all.
    pub fn new(config: &AbacConfig) -> Result<Self> {
        let http = build_http_client()?;
        Ok(Self {
            enabled: config.enabled,
            url: format!("http://{}:{}/appAccessesObject", config.host, config.port),
            id: config.id.clone(),
            principal_id: config.principal_id.clone(),
            test_override: config.test_override.clone(),
            http: Mutex::new(http),
        })
    }

    /// Whether admission checks are active for this route
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Ask the policy service whether a client connection may proceed.
    ///
    /// Disabled routes always allow. A transport failure resets the HTTP
    /// handle and denies this check without retrying; an error is surfaced
    /// only when a replacement handle cannot even be built, and callers
    /// decide how hard to fail.
    pub async fn check(&self, ip: &str, port: u16) -> Result<AbacDecision> {
        if !self.enabled {
            return Ok(AbacDecision::Allow);
        }

        let (ip, port) = match &self.test_override {
            Some((test_ip, test_port)) => (test_ip.as_str(), *test_port),
            None => (ip, port),
        };
        let body = json!({
            "principal": self.principal_id,
            "otherValues": [format!("{}:{}", ip, port), self.id],
        });
        debug!("checking policy for {}:{}", ip, port);

        let mut http = self.http.lock().await;
        let response = match http.post(&self.url).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                error!("policy request error: {}", e);
                self.reset(&mut http)?;
                return Ok(AbacDecision::Deny);
            }
        };
        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                error!("policy response error: {}", e);
                self.reset(&mut http)?;
                return Ok(AbacDecision::Deny);
            }
        };
        drop(http);

        debug!("policy result: {}", text);
        if text.contains("RuntimeException") {
            debug!("denied by policy service");
            return Ok(AbacDecision::Deny);
        }
        if status != reqwest::StatusCode::OK {
            error!(
                "policy check returned status {} for {}:{}",
                status.as_u16(),
                ip,
                port
            );
            return Ok(AbacDecision::Deny);
        }

        Ok(AbacDecision::Allow)
    }

    /// Replace the HTTP handle after a transport error. The URL is kept.
    /// When no replacement can be built the old handle stays in place and
    /// the failure is reported.
    fn reset(&self, http: &mut reqwest::Client) -> Result<()> {
        *http = build_http_client()?;
        Ok(())
    }
}

fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .tcp_nodelay(true)
        .build()
        .map_err(|e| RoutingError::FatalInit(format!("failed to build policy HTTP client: {}", e)))
}
