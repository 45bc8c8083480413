//! mysql-router - transparent MySQL connection routing
//!
//! This library provides the core functionality of a TCP-level connection
//! router that:
//! - Accepts MySQL client connections and forwards them to a configured
//!   destination set (round-robin or first-available)
//! - Inspects the handshake phase for packet-sequence violations and TLS
//!   switching without ever parsing query traffic
//! - Counts handshake failures per client address and blocks repeat
//!   offenders at accept time
//! - Gates new connections through an external attestation-based access
//!   control (ABAC) service and revalidates established connections on
//!   demand

#[macro_use]
mod logging;

pub mod abac;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;

pub use abac::{AbacClient, AbacDecision, ConnectionRegistry};
pub use config::{
    load_config, load_config_from_str, AbacConfig, AccessMode, Config, RouteConfig, TcpAddress,
};
pub use error::{Result, RoutingError};
pub use server::{ClientBlockList, Destinations, HandshakeInspector, Router, RouterStats};
