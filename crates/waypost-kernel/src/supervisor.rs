//! Shutdown signalling and connection accounting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    active: AtomicU64,
    violations: AtomicU64,
}

/// Shutdown signal shared by listeners and connections.
pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    counters: Arc<Counters>,
}

impl Supervisor {
    /// Create a new supervisor.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            shutdown_tx: tx,
            shutdown_rx: rx,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Get a receiver that flips to `true` on shutdown.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Trigger a graceful shutdown.
    pub fn shutdown(&self) {
        info!("Supervisor: initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Count an accepted connection. It stays active until the ticket drops.
    pub fn connection_opened(&self) -> ConnectionTicket {
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        self.counters.active.fetch_add(1, Ordering::Relaxed);
        ConnectionTicket {
            counters: self.counters.clone(),
        }
    }

    /// Record a connection dropped for breaking the protocol.
    pub fn record_violation(&self) {
        let total = self.counters.violations.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(total_violations = total, "Protocol violation recorded");
    }

    /// Get a health summary.
    pub fn health(&self) -> SupervisorHealth {
        SupervisorHealth {
            is_shutting_down: self.is_shutting_down(),
            connections_accepted: self.counters.accepted.load(Ordering::Relaxed),
            connections_active: self.counters.active.load(Ordering::Relaxed),
            protocol_violations: self.counters.violations.load(Ordering::Relaxed),
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a connection counted as active.
pub struct ConnectionTicket {
    counters: Arc<Counters>,
}

impl Drop for ConnectionTicket {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Health report from the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHealth {
    pub is_shutting_down: bool,
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub protocol_violations: u64,
}
