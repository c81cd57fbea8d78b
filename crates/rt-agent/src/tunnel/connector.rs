//! Tunnel establishment
//!
//! A [`Connector`] produces one live [`Tunnel`]: an authenticated session
//! with its remote forward in place and forwarded connections flowing to
//! the local service. The supervisor only sees these two traits.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use rt_core::{SessionState, TunnelConfig, TunnelError};

use super::forward::{BoundPort, PortForwardListener};
use super::session::SshSession;
use crate::state::TunnelState;

/// Something that can bring a tunnel up
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Tunnel: Tunnel;

    /// One connection attempt, no retries
    async fn connect(&self) -> Result<Self::Tunnel, TunnelError>;
}

/// A live tunnel
#[async_trait]
pub trait Tunnel: Send + Sync + 'static {
    /// Port the relay bound for us
    fn bound_port(&self) -> u16;

    /// Resolves once the tunnel is gone for any reason
    async fn closed(&self);

    /// Tear the tunnel down: bridges first, then the forward, then the
    /// session. Returns once everything has stopped.
    async fn shutdown(self);
}

/// Production connector: SSH session plus remote forward
pub struct SshConnector {
    config: Arc<TunnelConfig>,
    state: Arc<TunnelState>,
}

impl SshConnector {
    pub fn new(config: Arc<TunnelConfig>, state: Arc<TunnelState>) -> Self {
        Self { config, state }
    }

    async fn try_connect(&self) -> Result<SshTunnel, TunnelError> {
        let mut session = SshSession::connect(&self.config, &self.state).await?;

        let forward = PortForwardListener::request_forward(
            &mut session,
            &self.state,
            &self.config.bind_address,
            self.config.public_port,
            self.config.connect_timeout,
        )
        .await;

        let bound = match forward {
            Ok(bound) => bound,
            Err(e) => {
                // A session without its forward is useless.
                session.disconnect().await;
                self.state.set_session_state(SessionState::Disconnected);
                return Err(e.into());
            }
        };

        let Some(incoming) = session.take_incoming() else {
            session.disconnect().await;
            self.state.set_session_state(SessionState::Disconnected);
            return Err(rt_core::ForwardError::SessionClosed.into());
        };

        let listener = PortForwardListener::spawn(
            incoming,
            self.config.local_target(),
            Arc::clone(&self.state),
            self.config.half_close_timeout,
            CancellationToken::new(),
        );

        Ok(SshTunnel {
            session,
            listener,
            bound,
            state: Arc::clone(&self.state),
        })
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Tunnel = SshTunnel;

    async fn connect(&self) -> Result<SshTunnel, TunnelError> {
        match self.try_connect().await {
            Ok(tunnel) => {
                self.state.metrics().session_established();
                tracing::info!(
                    "Tunnel up: {}:{} -> {}",
                    self.config.relay_host,
                    tunnel.bound.port,
                    self.config.local_target()
                );
                Ok(tunnel)
            }
            Err(e) => {
                self.state.metrics().connect_failed();
                Err(e)
            }
        }
    }
}

/// A connected session with its forward and listener
pub struct SshTunnel {
    session: SshSession,
    listener: PortForwardListener,
    bound: BoundPort,
    state: Arc<TunnelState>,
}

#[async_trait]
impl Tunnel for SshTunnel {
    fn bound_port(&self) -> u16 {
        self.bound.port
    }

    async fn closed(&self) {
        self.session.closed().await
    }

    async fn shutdown(self) {
        let SshTunnel {
            mut session,
            listener,
            bound,
            state,
        } = self;

        listener.shutdown().await;

        if !session.is_closed() {
            let port = if bound.requested == 0 {
                bound.port
            } else {
                bound.requested
            };
            if let Err(e) = session
                .handle_mut()
                .cancel_tcpip_forward(bound.address.as_str(), u32::from(port))
                .await
            {
                tracing::debug!("Failed to cancel remote forward: {}", e);
            }
        }

        session.disconnect().await;
        state.set_session_state(SessionState::Disconnected);
        tracing::debug!("Tunnel on port {} torn down", bound.port);
    }
}
