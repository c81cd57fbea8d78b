//! Outbound SSH session to the relay
//!
//! Connects, authenticates, keeps the transport alive and tells the owner
//! exactly once when the session is gone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use rt_core::{AuthMethod, ConnectError, SessionState, TunnelConfig};

use crate::state::TunnelState;

/// How long `disconnect` waits for the session task to wind down.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A credential ready to be offered to the relay
enum Credential {
    Key(Arc<KeyPair>),
    Password(String),
}

impl Credential {
    fn name(&self) -> &'static str {
        match self {
            Credential::Key(_) => "publickey",
            Credential::Password(_) => "password",
        }
    }
}

/// A relay-initiated `forwarded-tcpip` channel
pub struct IncomingChannel {
    pub channel: Channel<Msg>,
    /// Remote peer of the public connection
    pub originator: (String, u32),
}

impl IncomingChannel {
    /// `host:port` of the public client
    pub fn origin(&self) -> String {
        format!("{}:{}", self.originator.0, self.originator.1)
    }
}

/// One authenticated SSH connection to the relay
pub struct SshSession {
    handle: Handle<RelayHandler>,
    closed: CancellationToken,
    incoming: Option<mpsc::UnboundedReceiver<IncomingChannel>>,
}

impl SshSession {
    /// Connect and authenticate.
    ///
    /// Credentials are resolved before any network traffic: an unreadable
    /// key is skipped in favour of the password, and if nothing usable is
    /// left the attempt fails with [`ConnectError::AuthUnavailable`]. On
    /// success the shared state is `Connected`; on failure it is left
    /// `Disconnected`.
    pub async fn connect(
        config: &TunnelConfig,
        state: &TunnelState,
    ) -> Result<Self, ConnectError> {
        let credentials = resolve_credentials(config.auth.methods());
        if credentials.is_empty() {
            return Err(ConnectError::AuthUnavailable);
        }

        state.set_session_state(SessionState::Connecting);
        let result = Self::establish(config, credentials).await;
        match &result {
            Ok(_) => state.set_session_state(SessionState::Connected),
            Err(_) => state.set_session_state(SessionState::Disconnected),
        }
        result
    }

    async fn establish(
        config: &TunnelConfig,
        credentials: Vec<Credential>,
    ) -> Result<Self, ConnectError> {
        let address = config.relay_address();
        let ssh_config = Arc::new(Config {
            keepalive_interval: Some(config.keepalive_interval),
            keepalive_max: config.keepalive_max,
            ..Default::default()
        });

        let closed = CancellationToken::new();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let handler = RelayHandler {
            expected_host_key: config.relay_host_key.clone(),
            _closed: closed.clone().drop_guard(),
            incoming_tx,
        };

        tracing::debug!("Connecting to {}", address);
        let connecting = async {
            let mut handle = client::connect(ssh_config, address.as_str(), handler)
                .await
                .map_err(|e| classify_connect_error(&address, e))?;
            authenticate(&mut handle, &config.ssh_user, credentials).await?;
            Ok::<_, ConnectError>(handle)
        };

        let handle = tokio::time::timeout(config.connect_timeout, connecting)
            .await
            .map_err(|_| ConnectError::Timeout {
                address: address.clone(),
                timeout: config.connect_timeout,
            })??;

        tracing::info!("SSH session established with {} as '{}'", address, config.ssh_user);

        Ok(Self {
            handle,
            closed,
            incoming: Some(incoming_rx),
        })
    }

    /// Wait until the session is gone
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.handle.is_closed()
    }

    /// Take the stream of relay-initiated channels. Yields `None` after the
    /// first call.
    pub fn take_incoming(&mut self) -> Option<mpsc::UnboundedReceiver<IncomingChannel>> {
        self.incoming.take()
    }

    pub(crate) fn handle_mut(&mut self) -> &mut Handle<RelayHandler> {
        &mut self.handle
    }

    /// Disconnect and wait for the session task to finish
    pub async fn disconnect(self) {
        if !self.is_closed() {
            if let Err(e) = self
                .handle
                .disconnect(Disconnect::ByApplication, "tunnel shutting down", "en")
                .await
            {
                tracing::debug!("Disconnect failed: {}", e);
            }
        }
        if tokio::time::timeout(DISCONNECT_TIMEOUT, self.closed.cancelled())
            .await
            .is_err()
        {
            tracing::warn!("SSH session did not close within {:?}", DISCONNECT_TIMEOUT);
        }
    }
}

/// Load keys up front. A key that cannot be read is logged and skipped so
/// the password can still be tried.
fn resolve_credentials(methods: Vec<AuthMethod>) -> Vec<Credential> {
    let mut credentials = Vec::with_capacity(methods.len());
    for method in methods {
        match method {
            AuthMethod::PrivateKey { path, passphrase } => {
                match russh_keys::load_secret_key(&path, passphrase.as_deref()) {
                    Ok(key) => credentials.push(Credential::Key(Arc::new(key))),
                    Err(e) => {
                        tracing::warn!("Failed to load private key {}: {}", path.display(), e);
                    }
                }
            }
            AuthMethod::Password(password) => credentials.push(Credential::Password(password)),
        }
    }
    credentials
}

async fn authenticate(
    handle: &mut Handle<RelayHandler>,
    user: &str,
    credentials: Vec<Credential>,
) -> Result<(), ConnectError> {
    for credential in credentials {
        let method = credential.name();
        tracing::debug!("Authenticating as '{}' with {}", user, method);
        let accepted = match credential {
            Credential::Key(key) => handle.authenticate_publickey(user, key).await,
            Credential::Password(password) => {
                handle.authenticate_password(user, password).await
            }
        }
        .map_err(|e| ConnectError::Network(format!("Authentication error: {}", e)))?;

        if accepted {
            tracing::debug!("Authenticated with {}", method);
            return Ok(());
        }
        tracing::warn!("Relay rejected {} authentication for '{}'", method, user);
    }

    Err(ConnectError::AuthRejected {
        user: user.to_string(),
    })
}

fn classify_connect_error(address: &str, e: anyhow::Error) -> ConnectError {
    let host_key_rejected = matches!(
        e.downcast_ref::<russh::Error>(),
        Some(russh::Error::UnknownKey)
    ) || e.to_string().contains("Unknown server key");
    if host_key_rejected {
        return ConnectError::HostKeyRejected {
            message: format!("Host key of {} does not match the configured fingerprint", address),
        };
    }
    ConnectError::Network(format!("Failed to connect to {}: {}", address, e))
}

/// SSH client handler for the relay session.
///
/// Dropped by russh when the session task ends, which cancels the
/// session's `closed` token.
pub(crate) struct RelayHandler {
    expected_host_key: Option<String>,
    _closed: DropGuard,
    incoming_tx: mpsc::UnboundedSender<IncomingChannel>,
}

#[async_trait]
impl client::Handler for RelayHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        tracing::debug!("Relay host key: {}", fingerprint);

        match &self.expected_host_key {
            Some(expected) if *expected != fingerprint => {
                tracing::error!(
                    "Relay host key mismatch: expected {}, got {}",
                    expected,
                    fingerprint
                );
                Ok(false)
            }
            Some(_) => {
                tracing::debug!("Relay host key verified against configured fingerprint");
                Ok(true)
            }
            None => Ok(true),
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(
            "Forwarded connection on {}:{} from {}:{}",
            connected_address,
            connected_port,
            originator_address,
            originator_port
        );

        let incoming = IncomingChannel {
            channel,
            originator: (originator_address.to_string(), originator_port),
        };

        // Nobody is listening any more; refuse the connection.
        if let Err(mpsc::error::SendError(incoming)) = self.incoming_tx.send(incoming) {
            tracing::debug!("No listener for {}, closing channel", incoming.origin());
            let _ = incoming.channel.close().await;
        }
        Ok(())
    }
}
