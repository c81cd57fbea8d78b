//! rt-agent: Reverse SSH tunnel agent
//!
//! The agent runs next to a private service, opens an outbound SSH
//! session to a public relay and asks the relay to forward a public port
//! back through that session. Every forwarded connection is bridged to
//! the local service; lost sessions are re-established automatically.

pub mod metrics;
pub mod state;
pub mod tunnel;

pub use state::TunnelState;
pub use tunnel::ReconnectSupervisor;
