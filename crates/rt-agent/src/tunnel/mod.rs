//! Reverse tunnel to the relay

mod bridge;
mod connector;
mod forward;
mod reconnect;
mod session;
mod supervisor;

pub use bridge::{
    ActiveBridge, BridgeError, BridgeRegistry, BridgeSnapshot, ConnectionBridge, RelayChannel,
    RelayMsg,
};
pub use connector::{Connector, SshConnector, SshTunnel, Tunnel};
pub use forward::{BoundPort, PortForwardListener};
pub use reconnect::{ExponentialBackoff, ReconnectPolicy};
pub use session::{IncomingChannel, SshSession};
pub use supervisor::ReconnectSupervisor;
