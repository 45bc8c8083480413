//! Configuration loader

use std::path::Path;

use serde::Deserialize;

use super::types::{RouteConfig, RouteSection, TcpAddress};
use crate::error::{Result, RoutingError};

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level used when neither --verbose nor RUST_LOG is given
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Root configuration structure
///
/// # Example
///
/// ```yaml
/// logging:
///   level: info
///
/// routes:
///   - name: ro
///     bind_address: "127.0.0.1"
///     bind_port: 7001
///     destinations: "10.0.10.5,10.0.11.6:3307"
///     mode: read-only
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Route sections
    #[serde(default)]
    pub routes: Vec<RouteSection>,
}

impl Config {
    /// Validate every route section and check cross-route constraints.
    pub fn validate(&self) -> Result<Vec<RouteConfig>> {
        if self.routes.is_empty() {
            return Err(RoutingError::Config(
                "no routes defined in configuration".to_string(),
            ));
        }

        let mut routes = Vec::with_capacity(self.routes.len());
        let mut bind_addresses: Vec<TcpAddress> = Vec::new();
        for section in &self.routes {
            let route = section.validate()?;

            let duplicate = bind_addresses.contains(&route.bind_address)
                || (matches!(route.bind_address.host.as_str(), "0.0.0.0" | "::")
                    && bind_addresses
                        .iter()
                        .any(|addr| addr.port == route.bind_address.port));
            if duplicate {
                return Err(RoutingError::Config(format!(
                    "in [{}]: duplicate IP or name found in bind_address '{}'",
                    route.name, route.bind_address
                )));
            }

            bind_addresses.push(route.bind_address.clone());
            routes.push(route);
        }
        Ok(routes)
    }
}

/// Load configuration from a YAML file
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)?;
    load_config_from_str(&contents)
}

/// Load configuration from a YAML string (useful for testing)
pub fn load_config_from_str(yaml: &str) -> Result<Config> {
    let mut config: Config =
        serde_yaml::from_str(yaml).map_err(|e| RoutingError::Config(e.to_string()))?;
    resolve_config_env_vars(&mut config);
    Ok(config)
}

/// Expand an environment reference in an option value.
///
/// A value written entirely as `${NAME}` or `$NAME` is replaced with the
/// content of that variable. Anything else, including references to unset
/// variables, passes through untouched.
fn resolve_env_var(value: &str) -> String {
    env_var_name(value)
        .and_then(|name| std::env::var(name).ok())
        .unwrap_or_else(|| value.to_string())
}

/// The variable name a value refers to, if the whole value is one
/// `${NAME}` or `$NAME` reference.
fn env_var_name(value: &str) -> Option<&str> {
    let rest = value.strip_prefix('$')?;
    if let Some(braced) = rest.strip_prefix('{') {
        return braced.strip_suffix('}');
    }
    (!rest.is_empty() && !rest.contains(' ')).then_some(rest)
}

/// Resolve environment variables in the options that carry deployment
/// identities.
fn resolve_config_env_vars(config: &mut Config) {
    for section in &mut config.routes {
        if let Some(ref host) = section.abac_host {
            section.abac_host = Some(resolve_env_var(host));
        }
        if let Some(ref id) = section.abac_id {
            section.abac_id = Some(resolve_env_var(id));
        }
        if let Some(ref principal) = section.abac_principal_id {
            section.abac_principal_id = Some(resolve_env_var(principal));
        }
    }
}
