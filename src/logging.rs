//! Logging macros that set target to "mysql_router" for all log calls.
//!
//! Without an explicit target, tracing uses the full module path
//! (e.g., "mysql_router::server::listener"), which makes filtering and
//! downstream log collection noisier than necessary. These macros ensure
//! all logs from this crate use a single "mysql_router" target.

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!(target: "mysql_router", $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!(target: "mysql_router", $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!(target: "mysql_router", $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!(target: "mysql_router", $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!(target: "mysql_router", $($arg)*) };
}
