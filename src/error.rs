//! Error types for mysql-router

use thiserror::Error;

/// Main error type for the router
#[derive(Error, Debug)]
pub enum RoutingError {
    /// I/O error (network, file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error; fatal for the route it belongs to
    #[error("{0}")]
    Config(String),

    /// Wire-protocol violation during the handshake phase
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection-level error (bind, accept, peer lookup)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Every configured destination was tried and failed
    #[error("None of the destinations is reachable")]
    NoReachableDestination,

    /// The policy service could not be reached
    #[error("Policy transport error: {0}")]
    PolicyTransport(String),

    /// A component could not be constructed at all; fatal for the process
    #[error("Fatal initialization error: {0}")]
    FatalInit(String),
}

/// Result type alias for RoutingError
pub type Result<T> = std::result::Result<T, RoutingError>;
