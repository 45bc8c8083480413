//! mysql-router - transparent MySQL connection routing
//!
//! This binary reads a configuration file describing one or more routes and
//! runs them until the process is asked to stop. SIGUSR2 triggers a
//! revalidation pass over established, policy-admitted connections.

use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

use mysql_router::{load_config, Result, Router};

#[derive(Parser)]
#[command(name = "mysql-router")]
#[command(version)]
#[command(about = "Transparent MySQL connection router with ABAC admission control")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Enable verbose/debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration before logging so the configured level can serve
    // as the fallback.
    let config = load_config(&cli.config)?;

    // Priority: --verbose flag, then RUST_LOG env var, then config level
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone())
    };
    tracing_subscriber::fmt().with_env_filter(&log_level).init();

    info!("Starting mysql-router v{}", env!("CARGO_PKG_VERSION"));

    let routes = config.validate()?;
    info!("Loaded {} route(s) from {:?}", routes.len(), cli.config);

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let mut handles = Vec::with_capacity(routes.len());
    for route in routes {
        let name = route.name.clone();
        match Router::bind(route, shutdown_tx.subscribe()).await {
            Ok(router) => {
                handles.push(tokio::spawn(async move {
                    if let Err(e) = router.run().await {
                        error!("{}: {}", name, e);
                    }
                }));
            }
            // A route that cannot even build its policy client takes the
            // process down; anything else only loses that route.
            Err(e @ mysql_router::RoutingError::FatalInit(_)) => return Err(e),
            Err(e) => error!("{}: {}", name, e),
        }
    }

    if handles.is_empty() {
        return Err(mysql_router::RoutingError::Config(
            "no route could be started".to_string(),
        ));
    }

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("Failed to install SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Stop the accept loops; in-flight sessions drain naturally
    let _ = shutdown_tx.send(());

    for handle in handles {
        let _ = handle.await;
    }

    info!("Shutdown complete");
    Ok(())
}
