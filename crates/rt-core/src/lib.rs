//! rt-core: Core configuration and types for rtunnel
//!
//! This crate provides the tunnel configuration, the error taxonomy and
//! the shared state enums used by the agent and by any process hosting it.

pub mod config;
pub mod error;
pub mod types;

pub use config::{AuthConfig, AuthMethod, BackoffConfig, TunnelConfig};
pub use error::{ConfigError, ConnectError, ForwardError, TunnelError};
pub use types::{BridgeId, SessionState, SupervisorState};
