//! The routing engine: listener, admission control, destination selection,
//! handshake inspection, and the per-connection relay.

pub mod blocklist;
pub mod destination;
pub mod inspector;
pub mod listener;
pub mod relay;

pub use blocklist::{client_ip_key, ClientBlockList};
pub use destination::Destinations;
pub use inspector::{HandshakeInspector, Inspection};
pub use listener::{Router, RouterStats};
pub use relay::{relay, RelayOutcome};
