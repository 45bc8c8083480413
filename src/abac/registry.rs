//! Registry of live, policy-admitted connections.
//!
//! Every admitted connection registers itself here for the lifetime of its
//! relay. A revalidation pass re-queries the policy service for each entry
//! and fires the close signal of connections whose decision has flipped;
//! the owning relay observes the signal and tears the session down. The
//! pass is triggered by SIGUSR2 through a dedicated task, so no work
//! happens in signal context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use super::client::{AbacClient, AbacDecision};
use crate::error::Result;

#[derive(Debug)]
struct Entry {
    ip: String,
    port: u16,
    revoke: Arc<Notify>,
}

/// Live-connection registry of one route.
#[derive(Default)]
#[derive(Debug)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
}

/// Membership of one connection in the registry. Dropping it removes the
/// entry.
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: u64,
    revoke: Arc<Notify>,
}

impl Registration {
    /// Handle the relay selects on to learn its admission was revoked
    pub fn revoke_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.revoke)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.entries.lock().unwrap().remove(&self.id);
    }
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection; the returned guard unregisters it on drop.
    pub fn register(registry: &Arc<Self>, ip: String, port: u16) -> Registration {
        let revoke = Arc::new(Notify::new());
        let id = registry.next_id.fetch_add(1, Ordering::Relaxed);
        registry.entries.lock().unwrap().insert(
            id,
            Entry {
                ip,
                port,
                revoke: Arc::clone(&revoke),
            },
        );
        Registration {
            registry: Arc::clone(registry),
            id,
            revoke,
        }
    }

    /// Number of live registered connections
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether no connection is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-check every registered connection against the policy service and
    /// signal the ones that are no longer allowed. Returns how many were
    /// signalled.
    pub async fn revalidate(&self, abac: &AbacClient) -> Result<usize> {
        let snapshot: Vec<(String, u16, Arc<Notify>)> = self
            .entries
            .lock()
            .unwrap()
            .values()
            .map(|entry| (entry.ip.clone(), entry.port, Arc::clone(&entry.revoke)))
            .collect();

        let mut revoked = 0;
        for (ip, port, revoke) in snapshot {
            if abac.check(&ip, port).await? == AbacDecision::Deny {
                warn!("invalidating connection from {}:{}", ip, port);
                revoke.notify_one();
                revoked += 1;
            }
        }
        Ok(revoked)
    }
}

/// Run revalidation passes whenever the process receives SIGUSR2, until the
/// shutdown signal arrives.
pub fn spawn_revalidation_task(
    registry: Arc<ConnectionRegistry>,
    abac: Arc<AbacClient>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut trigger = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::user_defined2(),
            ) {
                Ok(trigger) => trigger,
                Err(e) => {
                    error!("failed to install revalidation signal handler: {}", e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = trigger.recv() => {
                        info!("revalidating {} live connections", registry.len());
                        match registry.revalidate(&abac).await {
                            Ok(revoked) if revoked > 0 => info!("revoked {} connections", revoked),
                            Ok(_) => {}
                            Err(e) => error!("revalidation pass failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = registry;
            let _ = abac;
            let _ = shutdown_rx.recv().await;
        }
    })
}
