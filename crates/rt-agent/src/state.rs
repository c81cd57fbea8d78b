//! Shared tunnel state
//!
//! Read by the supervisor and by anything polling liveness; written by the
//! session, the forward listener and the bridge tasks.

use std::sync::atomic::{AtomicU16, Ordering};

use rt_core::SessionState;
use tokio::sync::watch;

use crate::metrics::TunnelMetrics;
use crate::tunnel::BridgeRegistry;

/// State shared between the tasks of one tunnel
pub struct TunnelState {
    /// Current session state, published to subscribers
    session: watch::Sender<SessionState>,
    /// Port the relay actually bound, 0 when no forward is active
    bound_port: AtomicU16,
    /// Live forwarded connections
    bridges: BridgeRegistry,
    /// Counters
    metrics: TunnelMetrics,
}

impl TunnelState {
    /// Create state for a disconnected tunnel
    pub fn new() -> Self {
        let (session, _) = watch::channel(SessionState::Disconnected);
        Self {
            session,
            bound_port: AtomicU16::new(0),
            bridges: BridgeRegistry::new(),
            metrics: TunnelMetrics::new(),
        }
    }

    /// Current session state
    pub fn session_state(&self) -> SessionState {
        *self.session.borrow()
    }

    /// Publish a session state transition
    pub fn set_session_state(&self, state: SessionState) {
        let previous = self.session.send_replace(state);
        if previous != state {
            tracing::debug!("Session state {} -> {}", previous, state);
        }
        if state != SessionState::ForwardingActive {
            self.bound_port.store(0, Ordering::Relaxed);
        }
    }

    /// Watch session state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }

    /// Whether the relay is currently forwarding the public port to us
    pub fn is_forwarding(&self) -> bool {
        self.session_state() == SessionState::ForwardingActive
    }

    /// Port the relay bound for the active forward
    pub fn bound_port(&self) -> Option<u16> {
        match self.bound_port.load(Ordering::Relaxed) {
            0 => None,
            port => Some(port),
        }
    }

    /// Record the forward as active on `port`
    pub fn mark_forwarding(&self, port: u16) {
        self.bound_port.store(port, Ordering::Relaxed);
        self.set_session_state(SessionState::ForwardingActive);
    }

    /// Live forwarded connections
    pub fn bridges(&self) -> &BridgeRegistry {
        &self.bridges
    }

    /// Tunnel counters
    pub fn metrics(&self) -> &TunnelMetrics {
        &self.metrics
    }
}

impl Default for TunnelState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_disconnected() {
        let state = TunnelState::new();
        assert_eq!(state.session_state(), SessionState::Disconnected);
        assert!(!state.is_forwarding());
        assert_eq!(state.bound_port(), None);
    }

    #[test]
    fn test_bound_port_follows_forwarding() {
        let state = TunnelState::new();
        state.mark_forwarding(9009);
        assert!(state.is_forwarding());
        assert_eq!(state.bound_port(), Some(9009));

        state.set_session_state(SessionState::Disconnected);
        assert!(!state.is_forwarding());
        assert_eq!(state.bound_port(), None);
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let state = TunnelState::new();
        let mut rx = state.subscribe();

        state.set_session_state(SessionState::Connecting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionState::Connecting);
    }
}
