//! Tunnel counters
//!
//! Plain atomics updated from the session, listener and bridge tasks.
//! Nothing here feeds back into flow control.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative counters for one tunnel
#[derive(Debug, Default)]
pub struct TunnelMetrics {
    sessions_established: AtomicU64,
    connect_failures: AtomicU64,
    bridges_opened: AtomicU64,
    bridges_rejected: AtomicU64,
    bytes_relay_to_local: AtomicU64,
    bytes_local_to_relay: AtomicU64,
}

/// Point-in-time copy of [`TunnelMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Sessions that reached `ForwardingActive`
    pub sessions_established: u64,
    /// Failed connect or forward attempts
    pub connect_failures: u64,
    /// Forwarded connections bridged to the local service
    pub bridges_opened: u64,
    /// Forwarded connections rejected because the local dial failed
    pub bridges_rejected: u64,
    /// Bytes copied from relay channels to local sockets
    pub bytes_relay_to_local: u64,
    /// Bytes copied from local sockets to relay channels
    pub bytes_local_to_relay: u64,
}

impl TunnelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_established(&self) {
        self.sessions_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bridge_opened(&self) {
        self.bridges_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bridge_rejected(&self) {
        self.bridges_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_relay_to_local(&self, n: u64) {
        self.bytes_relay_to_local.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_local_to_relay(&self, n: u64) {
        self.bytes_local_to_relay.fetch_add(n, Ordering::Relaxed);
    }

    /// Collect the current counter values
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_established: self.sessions_established.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            bridges_opened: self.bridges_opened.load(Ordering::Relaxed),
            bridges_rejected: self.bridges_rejected.load(Ordering::Relaxed),
            bytes_relay_to_local: self.bytes_relay_to_local.load(Ordering::Relaxed),
            bytes_local_to_relay: self.bytes_local_to_relay.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = TunnelMetrics::new();
        metrics.session_established();
        metrics.bridge_opened();
        metrics.bridge_opened();
        metrics.bridge_rejected();
        metrics.add_relay_to_local(10);
        metrics.add_local_to_relay(4);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions_established, 1);
        assert_eq!(snapshot.bridges_opened, 2);
        assert_eq!(snapshot.bridges_rejected, 1);
        assert_eq!(snapshot.bytes_relay_to_local, 10);
        assert_eq!(snapshot.bytes_local_to_relay, 4);
        assert_eq!(snapshot.connect_failures, 0);
    }
}
