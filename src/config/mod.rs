//! Router configuration: raw file schema and validated route settings.

mod loader;
mod types;

pub use loader::{load_config, load_config_from_str, Config, LoggingConfig};
pub use types::{AbacConfig, AccessMode, RouteConfig, RouteSection, TcpAddress};

pub(crate) use types::split_host_port;
