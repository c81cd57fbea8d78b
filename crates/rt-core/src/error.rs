//! Core error types for rtunnel

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures while establishing the SSH session
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Neither a loadable private key nor a password is available
    #[error("No usable SSH credential (private key or password)")]
    AuthUnavailable,

    /// The relay rejected every credential we offered
    #[error("Authentication rejected for user '{user}'")]
    AuthRejected { user: String },

    /// The relay's host key did not match the configured fingerprint
    #[error("Host key verification failed: {message}")]
    HostKeyRejected { message: String },

    /// Handshake or authentication did not finish in time
    #[error("Connection to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    /// TCP or SSH transport failure
    #[error("Network error: {0}")]
    Network(String),
}

/// Failures of the remote port-forward request
#[derive(Error, Debug)]
pub enum ForwardError {
    /// The relay refused to listen (port in use, policy)
    #[error("Relay rejected forward of {address}:{port}")]
    Rejected { address: String, port: u16 },

    /// The relay did not answer the forward request in time
    #[error("Forward request timed out after {0:?}")]
    Timeout(Duration),

    /// The session closed before or during the request
    #[error("Session closed")]
    SessionClosed,

    /// Any other protocol failure
    #[error("Forward request failed: {0}")]
    Request(String),
}

/// A failure that takes down the whole tunnel
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Connection or authentication failure
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Remote forward failure
    #[error(transparent)]
    Forward(#[from] ForwardError),
}

impl TunnelError {
    /// Whether this failure stems from credentials or host identity
    /// rather than from the network.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            TunnelError::Connect(
                ConnectError::AuthUnavailable
                    | ConnectError::AuthRejected { .. }
                    | ConnectError::HostKeyRejected { .. }
            )
        )
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Neither password nor private key configured
    #[error("No SSH credential configured (set a password or a private key path)")]
    NoCredential,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failures_are_classified() {
        let rejected: TunnelError = ConnectError::AuthRejected {
            user: "tunnel".into(),
        }
        .into();
        assert!(rejected.is_auth_failure());
        assert!(TunnelError::from(ConnectError::AuthUnavailable).is_auth_failure());
    }

    #[test]
    fn test_network_failures_are_not_auth() {
        let network: TunnelError = ConnectError::Network("connection refused".into()).into();
        assert!(!network.is_auth_failure());

        let forward: TunnelError = ForwardError::Rejected {
            address: String::new(),
            port: 9009,
        }
        .into();
        assert!(!forward.is_auth_failure());
    }
}
