//! Reverse tunnel configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use super::backoff::BackoffConfig;
use super::expand_home;
use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Default for [`TunnelConfig::half_close_timeout`].
pub const DEFAULT_HALF_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to expose one local service through a relay.
///
/// Built once at startup and never mutated afterwards; the supervisor
/// that owns it hands out shared references only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Public relay host or IP to SSH into
    pub relay_host: String,

    /// SSH port on the relay
    pub relay_ssh_port: u16,

    /// Login on the relay
    pub ssh_user: String,

    /// Credentials
    pub auth: AuthConfig,

    /// Address the relay should listen on.
    ///
    /// Empty means all interfaces, subject to the relay's `GatewayPorts`.
    pub bind_address: String,

    /// Port the relay exposes publicly (0 lets the relay choose)
    pub public_port: u16,

    /// Host of the local service
    pub local_target_host: String,

    /// Port of the local service
    pub local_target_port: u16,

    /// SSH keepalive interval
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// Missed keepalives before the session is considered dead
    pub keepalive_max: usize,

    /// Handshake, authentication and forward-request timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Fixed delay between reconnect attempts
    #[serde(with = "duration_secs")]
    pub reconnect_delay: Duration,

    /// Exponential backoff; replaces `reconnect_delay` when set
    pub backoff: Option<BackoffConfig>,

    /// How long a forwarded connection may sit idle after one direction
    /// has finished before it is closed (default
    /// [`DEFAULT_HALF_CLOSE_TIMEOUT`], 30 s). Raise it for
    /// services that answer slowly after the client stops sending.
    #[serde(with = "duration_secs")]
    pub half_close_timeout: Duration,

    /// Expected relay host key fingerprint. Any key is accepted when unset.
    pub relay_host_key: Option<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            relay_host: String::new(),
            relay_ssh_port: 22,
            ssh_user: String::new(),
            auth: AuthConfig::default(),
            bind_address: String::new(),
            public_port: 9009,
            local_target_host: "127.0.0.1".to_string(),
            local_target_port: 9001,
            keepalive_interval: Duration::from_secs(30),
            keepalive_max: 5,
            connect_timeout: Duration::from_secs(20),
            reconnect_delay: Duration::from_secs(15),
            backoff: None,
            half_close_timeout: DEFAULT_HALF_CLOSE_TIMEOUT,
            relay_host_key: None,
        }
    }
}

impl TunnelConfig {
    /// `host:port` of the relay's SSH server
    pub fn relay_address(&self) -> String {
        format!("{}:{}", self.relay_host, self.relay_ssh_port)
    }

    /// `host:port` of the local service
    pub fn local_target(&self) -> String {
        format!("{}:{}", self.local_target_host, self.local_target_port)
    }

    /// Check that the configuration can produce a working tunnel
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay_host.trim().is_empty() {
            return Err(ConfigError::MissingField("relay_host".into()));
        }
        if self.ssh_user.trim().is_empty() {
            return Err(ConfigError::MissingField("ssh_user".into()));
        }
        if !self.auth.has_credential() {
            return Err(ConfigError::NoCredential);
        }
        if self.local_target_port == 0 {
            return Err(ConfigError::Invalid(
                "local_target_port must be non-zero".into(),
            ));
        }
        if self.keepalive_interval.is_zero() || self.keepalive_max == 0 {
            return Err(ConfigError::Invalid(
                "keepalive_interval and keepalive_max must be non-zero".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid("connect_timeout must be non-zero".into()));
        }
        if self.reconnect_delay.is_zero() {
            return Err(ConfigError::Invalid("reconnect_delay must be non-zero".into()));
        }
        if self.half_close_timeout.is_zero() {
            return Err(ConfigError::Invalid("half_close_timeout must be non-zero".into()));
        }
        if let Some(backoff) = &self.backoff {
            backoff.validate()?;
        }
        Ok(())
    }
}

/// SSH credentials as configured
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Password for password authentication
    pub password: Option<String>,

    /// Private key path, `~` is expanded
    pub private_key_path: Option<PathBuf>,

    /// Passphrase for an encrypted private key
    pub passphrase: Option<String>,
}

impl AuthConfig {
    /// Password-only credentials
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Default::default()
        }
    }

    /// Key-only credentials
    pub fn with_private_key(path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        Self {
            private_key_path: Some(path.into()),
            passphrase,
            ..Default::default()
        }
    }

    /// Whether at least one credential is configured
    pub fn has_credential(&self) -> bool {
        self.password().is_some() || self.private_key_path().is_some()
    }

    /// Non-empty password, if any
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }

    /// Non-empty private key path with `~` expanded, if any
    pub fn private_key_path(&self) -> Option<PathBuf> {
        self.private_key_path
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
            .map(expand_home)
    }

    /// Authentication methods in the order they should be attempted:
    /// private key first, then password.
    pub fn methods(&self) -> Vec<AuthMethod> {
        let mut methods = Vec::with_capacity(2);
        if let Some(path) = self.private_key_path() {
            methods.push(AuthMethod::PrivateKey {
                path,
                passphrase: self.passphrase.clone().filter(|p| !p.is_empty()),
            });
        }
        if let Some(password) = self.password() {
            methods.push(AuthMethod::Password(password.to_string()));
        }
        methods
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key_path", &self.private_key_path)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// One way of authenticating to the relay
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Public key authentication
    PrivateKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
    /// Password authentication
    Password(String),
}

impl AuthMethod {
    /// SSH method name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::PrivateKey { .. } => "publickey",
            AuthMethod::Password(_) => "password",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::PrivateKey { path, .. } => {
                f.debug_struct("PrivateKey").field("path", path).finish()
            }
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}
