//! Configuration types

use std::fmt;

use serde::Deserialize;

use crate::error::{Result, RoutingError};

// Defaults applied when a route section leaves an option unset.
const DEFAULT_CONNECT_TIMEOUT: i64 = 1;
const DEFAULT_MAX_CONNECTIONS: i64 = 512;
const DEFAULT_MAX_CONNECT_ERRORS: i64 = 100;
const DEFAULT_CLIENT_CONNECT_TIMEOUT: i64 = 9;
const DEFAULT_NET_BUFFER_LENGTH: i64 = 16384;

/// A host and TCP port pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpAddress {
    /// Host name or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl TcpAddress {
    /// Create a new address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for TcpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How the next destination is picked for a new connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Round-robin over all destinations
    ReadOnly,
    /// Always start from the head of the list, failing over to the next
    ReadWrite,
}

impl AccessMode {
    /// The configuration spelling of this mode
    pub fn name(&self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "read-only",
            AccessMode::ReadWrite => "read-write",
        }
    }
}

/// Attestation-based access control settings for a route
#[derive(Debug, Clone, Default)]
pub struct AbacConfig {
    /// Whether new connections are gated by the policy service
    pub enabled: bool,
    /// Policy service host
    pub host: String,
    /// Policy service port
    pub port: u16,
    /// Object identity sent with each policy request
    pub id: String,
    /// Principal identity sent with each policy request
    pub principal_id: String,
    /// Diagnostic override substituted for the real client identity
    pub test_override: Option<(String, u16)>,
}

/// Validated settings for one route
#[derive(Debug, Clone)]
pub struct RouteConfig {
    /// Section label, e.g. "routing" or "routing:ro"
    pub name: String,
    /// Address the route listens on
    pub bind_address: TcpAddress,
    /// Destination source: CSV of `host[:port]` or a `fabric+cache://` URI
    pub destinations: String,
    /// Destination selection policy
    pub mode: AccessMode,
    /// Destination dial timeout, seconds
    pub connect_timeout: u16,
    /// Maximum concurrently served connections
    pub max_connections: u16,
    /// Handshake failures per client before it is blocked
    pub max_connect_errors: u32,
    /// Handshake phase timeout, seconds
    pub client_connect_timeout: u32,
    /// Per-direction copy buffer, bytes
    pub net_buffer_length: u32,
    /// Policy admission settings
    pub abac: AbacConfig,
}

/// One `routes:` entry as it appears in the configuration file, before
/// validation. All numeric options are kept wide so out-of-range values can
/// be reported verbatim.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteSection {
    /// Optional route key; renders the section as `routing:<name>`
    #[serde(default)]
    pub name: Option<String>,
    /// `destinations` option
    #[serde(default)]
    pub destinations: Option<String>,
    /// `bind_port` option
    #[serde(default)]
    pub bind_port: Option<i64>,
    /// `bind_address` option, `host[:port]`
    #[serde(default)]
    pub bind_address: Option<String>,
    /// `connect_timeout` option
    #[serde(default)]
    pub connect_timeout: Option<i64>,
    /// `mode` option
    #[serde(default)]
    pub mode: Option<String>,
    /// `max_connections` option
    #[serde(default)]
    pub max_connections: Option<i64>,
    /// `max_connect_errors` option
    #[serde(default)]
    pub max_connect_errors: Option<i64>,
    /// `client_connect_timeout` option
    #[serde(default)]
    pub client_connect_timeout: Option<i64>,
    /// `net_buffer_length` option
    #[serde(default)]
    pub net_buffer_length: Option<i64>,
    /// `abac_enabled` option (non-zero enables)
    #[serde(default)]
    pub abac_enabled: Option<i64>,
    /// `abac_host` option
    #[serde(default)]
    pub abac_host: Option<String>,
    /// `abac_port` option
    #[serde(default)]
    pub abac_port: Option<i64>,
    /// `abac_id` option
    #[serde(default)]
    pub abac_id: Option<String>,
    /// `abac_principal_id` option
    #[serde(default)]
    pub abac_principal_id: Option<String>,
    /// `abac_test_ip` option (diagnostic identity override)
    #[serde(default)]
    pub abac_test_ip: Option<String>,
    /// `abac_test_port` option (diagnostic identity override)
    #[serde(default)]
    pub abac_test_port: Option<i64>,
}

impl RouteSection {
    /// How this section is referred to in diagnostics
    pub fn section_label(&self) -> String {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => format!("routing:{}", name),
            _ => "routing".to_string(),
        }
    }

    /// Range-check every option and produce the typed route settings
    pub fn validate(&self) -> Result<RouteConfig> {
        let section = self.section_label();

        if self.bind_port.is_none() && self.bind_address.is_none() {
            return Err(RoutingError::Config(format!(
                "in [{}]: either bind_port or bind_address is required",
                section
            )));
        }

        let bind_port = match self.bind_port {
            Some(value) => Some(uint_option(&section, "bind_port", value, 1, 65535)? as u16),
            None => None,
        };

        let (host, addr_port) = match self.bind_address.as_deref() {
            Some(raw) => parse_bind_address(&section, raw)?,
            None => ("0.0.0.0".to_string(), 0),
        };

        let port = if addr_port > 0 {
            addr_port
        } else {
            match bind_port {
                Some(port) => port,
                None => {
                    return Err(RoutingError::Config(format!(
                        "in [{}]: no bind_port, and TCP port in bind_address is not valid",
                        section
                    )))
                }
            }
        };

        let destinations = match self.destinations.as_deref() {
            Some(value) if !value.is_empty() => value.to_string(),
            _ => {
                return Err(RoutingError::Config(format!(
                    "option destinations in [{}] is required",
                    section
                )))
            }
        };

        let mode = match self.mode.as_deref() {
            Some("read-only") => AccessMode::ReadOnly,
            Some("read-write") => AccessMode::ReadWrite,
            Some(other) => {
                return Err(RoutingError::Config(format!(
                    "option mode in [{}] is invalid; valid are read-write and read-only (was '{}')",
                    section, other
                )))
            }
            None => {
                return Err(RoutingError::Config(format!(
                    "option mode in [{}] is required",
                    section
                )))
            }
        };

        let connect_timeout = uint_option(
            &section,
            "connect_timeout",
            self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            1,
            65535,
        )? as u16;
        let max_connections = uint_option(
            &section,
            "max_connections",
            self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            1,
            65535,
        )? as u16;
        let max_connect_errors = uint_option(
            &section,
            "max_connect_errors",
            self.max_connect_errors.unwrap_or(DEFAULT_MAX_CONNECT_ERRORS),
            1,
            u32::MAX as i64,
        )? as u32;
        let client_connect_timeout = uint_option(
            &section,
            "client_connect_timeout",
            self.client_connect_timeout
                .unwrap_or(DEFAULT_CLIENT_CONNECT_TIMEOUT),
            2,
            31_536_000,
        )? as u32;
        let net_buffer_length = uint_option(
            &section,
            "net_buffer_length",
            self.net_buffer_length.unwrap_or(DEFAULT_NET_BUFFER_LENGTH),
            1024,
            1_048_576,
        )? as u32;

        let abac_enabled =
            uint_option(&section, "abac_enabled", self.abac_enabled.unwrap_or(0), 0, 2)? != 0;
        let abac_port =
            uint_option(&section, "abac_port", self.abac_port.unwrap_or(0), 0, 65535)? as u16;
        let test_override = match self.abac_test_ip.as_deref() {
            Some(ip) if !ip.is_empty() => {
                let test_port = uint_option(
                    &section,
                    "abac_test_port",
                    self.abac_test_port.unwrap_or(0),
                    1,
                    65535,
                )? as u16;
                Some((ip.to_string(), test_port))
            }
            _ => None,
        };

        Ok(RouteConfig {
            name: section,
            bind_address: TcpAddress::new(host, port),
            destinations,
            mode,
            connect_timeout,
            max_connections,
            max_connect_errors,
            client_connect_timeout,
            net_buffer_length,
            abac: AbacConfig {
                enabled: abac_enabled,
                host: self.abac_host.clone().unwrap_or_default(),
                port: abac_port,
                id: self.abac_id.clone().unwrap_or_default(),
                principal_id: self.abac_principal_id.clone().unwrap_or_default(),
                test_override,
            },
        })
    }
}

fn uint_option(section: &str, option: &str, value: i64, min: i64, max: i64) -> Result<i64> {
    if value < min || value > max {
        return Err(RoutingError::Config(format!(
            "option {} in [{}] needs value between {} and {} inclusive, was '{}'",
            option, section, min, max, value
        )));
    }
    Ok(value)
}

fn parse_bind_address(section: &str, raw: &str) -> Result<(String, u16)> {
    let (host, port) = split_host_port(raw).map_err(|_| {
        RoutingError::Config(format!(
            "option bind_address in [{}] is incorrect (invalid TCP port: invalid characters or too long)",
            section
        ))
    })?;
    if host.is_empty() {
        return Err(RoutingError::Config(format!(
            "in [{}]: invalid IP or name in bind_address '{}'",
            section, raw
        )));
    }
    Ok((host, port))
}

/// Split `host[:port]` into its parts; a missing port is reported as 0.
/// Bracketed (`[::1]:3306`) and bare (`::1`) IPv6 forms are accepted.
pub(crate) fn split_host_port(address: &str) -> std::result::Result<(String, u16), String> {
    let address = address.trim();
    if let Some(rest) = address.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| format!("invalid address '{}'", address))?;
        let host = rest[..end].to_string();
        let tail = &rest[end + 1..];
        if tail.is_empty() {
            return Ok((host, 0));
        }
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| format!("invalid address '{}'", address))
            .and_then(parse_port)?;
        return Ok((host, port));
    }
    // More than one colon without brackets means a bare IPv6 address.
    if address.matches(':').count() > 1 {
        return Ok((address.to_string(), 0));
    }
    match address.split_once(':') {
        Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
        None => Ok((address.to_string(), 0)),
    }
}

fn parse_port(raw: &str) -> std::result::Result<u16, String> {
    raw.parse::<u16>()
        .map_err(|_| "invalid TCP port: invalid characters or too long".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_section() -> RouteSection {
        RouteSection {
            destinations: Some("127.0.0.1:3306".to_string()),
            mode: Some("read-only".to_string()),
            bind_port: Some(7001),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_minimal_defaults() {
        let config = minimal_section().validate().unwrap();
        assert_eq!(config.name, "routing");
        assert_eq!(config.bind_address, TcpAddress::new("0.0.0.0", 7001));
        assert_eq!(config.mode, AccessMode::ReadOnly);
        assert_eq!(config.connect_timeout, 1);
        assert_eq!(config.max_connections, 512);
        assert_eq!(config.max_connect_errors, 100);
        assert_eq!(config.client_connect_timeout, 9);
        assert_eq!(config.net_buffer_length, 16384);
        assert!(!config.abac.enabled);
    }

    #[test]
    fn test_validate_named_section_label() {
        let section = RouteSection {
            name: Some("ro".to_string()),
            ..minimal_section()
        };
        assert_eq!(section.validate().unwrap().name, "routing:ro");
    }

    #[test]
    fn test_invalid_bind_port_message() {
        let section = RouteSection {
            bind_port: Some(23_123_124_123_123),
            ..minimal_section()
        };
        let err = section.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "option bind_port in [routing] needs value between 1 and 65535 inclusive, was '23123124123123'"
        );
    }

    #[test]
    fn test_missing_port_in_bind_address_message() {
        let section = RouteSection {
            bind_port: None,
            bind_address: Some("127.0.0.1".to_string()),
            ..minimal_section()
        };
        let err = section.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "in [routing]: no bind_port, and TCP port in bind_address is not valid"
        );
    }

    #[test]
    fn test_either_bind_port_or_bind_address_required() {
        let section = RouteSection {
            bind_port: None,
            bind_address: None,
            ..minimal_section()
        };
        let err = section.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "in [routing]: either bind_port or bind_address is required"
        );
    }

    #[test]
    fn test_invalid_port_in_bind_address_message() {
        let section = RouteSection {
            bind_port: None,
            bind_address: Some("127.0.0.1:999292".to_string()),
            ..minimal_section()
        };
        let err = section.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "option bind_address in [routing] is incorrect (invalid TCP port: invalid characters or too long)"
        );
    }

    #[test]
    fn test_bind_address_port_overrides_bind_port() {
        let section = RouteSection {
            bind_address: Some("10.0.0.1:7002".to_string()),
            ..minimal_section()
        };
        let config = section.validate().unwrap();
        assert_eq!(config.bind_address, TcpAddress::new("10.0.0.1", 7002));
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let section = RouteSection {
            mode: Some("read-mostly".to_string()),
            ..minimal_section()
        };
        let err = section.validate().unwrap_err();
        assert!(err.to_string().contains("option mode in [routing] is invalid"));
        assert!(err.to_string().contains("read-mostly"));
    }

    #[test]
    fn test_client_connect_timeout_range() {
        let section = RouteSection {
            client_connect_timeout: Some(1),
            ..minimal_section()
        };
        let err = section.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "option client_connect_timeout in [routing] needs value between 2 and 31536000 inclusive, was '1'"
        );
    }

    #[test]
    fn test_net_buffer_length_range() {
        let section = RouteSection {
            net_buffer_length: Some(512),
            ..minimal_section()
        };
        assert!(section.validate().is_err());

        let section = RouteSection {
            net_buffer_length: Some(1024),
            ..minimal_section()
        };
        assert_eq!(section.validate().unwrap().net_buffer_length, 1024);
    }

    #[test]
    fn test_max_connect_errors_minimum() {
        let section = RouteSection {
            max_connect_errors: Some(0),
            ..minimal_section()
        };
        assert!(section.validate().is_err());
    }

    #[test]
    fn test_abac_settings() {
        let section = RouteSection {
            abac_enabled: Some(1),
            abac_host: Some("policy.local".to_string()),
            abac_port: Some(8080),
            abac_id: Some("router-1".to_string()),
            abac_principal_id: Some("db-clients".to_string()),
            ..minimal_section()
        };
        let config = section.validate().unwrap();
        assert!(config.abac.enabled);
        assert_eq!(config.abac.host, "policy.local");
        assert_eq!(config.abac.port, 8080);
        assert_eq!(config.abac.id, "router-1");
        assert_eq!(config.abac.principal_id, "db-clients");
        assert!(config.abac.test_override.is_none());
    }

    #[test]
    fn test_abac_test_override_requires_port() {
        let section = RouteSection {
            abac_test_ip: Some("10.1.2.3".to_string()),
            abac_test_port: None,
            ..minimal_section()
        };
        // Port defaults to 0, outside the 1..=65535 range for the override.
        assert!(section.validate().is_err());

        let section = RouteSection {
            abac_test_ip: Some("10.1.2.3".to_string()),
            abac_test_port: Some(3306),
            ..minimal_section()
        };
        let config = section.validate().unwrap();
        assert_eq!(
            config.abac.test_override,
            Some(("10.1.2.3".to_string(), 3306))
        );
    }

    #[test]
    fn test_split_host_port_forms() {
        assert_eq!(
            split_host_port("10.0.10.5:3307").unwrap(),
            ("10.0.10.5".to_string(), 3307)
        );
        assert_eq!(
            split_host_port("10.0.10.5").unwrap(),
            ("10.0.10.5".to_string(), 0)
        );
        assert_eq!(split_host_port("::1").unwrap(), ("::1".to_string(), 0));
        assert_eq!(
            split_host_port("[::1]:3306").unwrap(),
            ("::1".to_string(), 3306)
        );
        assert_eq!(split_host_port("[::1]").unwrap(), ("::1".to_string(), 0));
        assert!(split_host_port("host:99999999").is_err());
        assert!(split_host_port("host:abc").is_err());
    }
}
