//! Wire-protocol primitives invoked by the routing path.

pub mod mysql;
