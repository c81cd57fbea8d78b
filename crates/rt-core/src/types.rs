//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the single SSH session owned by a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No session exists
    Disconnected,
    /// Handshake and authentication in progress
    Connecting,
    /// Authenticated, no remote forward yet
    Connected,
    /// The relay accepted the forward and is handing us channels
    ForwardingActive,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::ForwardingActive => write!(f, "forwarding"),
        }
    }
}

/// State of the reconnect supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorState {
    /// Constructed, `start` not called yet
    Idle,
    /// Establishing (or waiting to re-establish) a session
    Connecting,
    /// A session with an active forward is up
    Active,
    /// Stopped; no further attempts will be made
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Idle => write!(f, "idle"),
            SupervisorState::Connecting => write!(f, "connecting"),
            SupervisorState::Active => write!(f, "active"),
            SupervisorState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Identifier of one forwarded connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BridgeId(pub u64);

impl fmt::Display for BridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bridge-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(format!("{}", SessionState::ForwardingActive), "forwarding");
        assert_eq!(format!("{}", SupervisorState::Stopped), "stopped");
        assert_eq!(format!("{}", BridgeId(7)), "bridge-7");
    }
}
