//! Attestation-based access control: per-connection admission checks and
//! revalidation of established connections.

pub mod client;
pub mod registry;

pub use client::{AbacClient, AbacDecision};
pub use registry::{spawn_revalidation_task, ConnectionRegistry, Registration};
