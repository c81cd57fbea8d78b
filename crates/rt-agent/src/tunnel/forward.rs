//! Remote port forwarding
//!
//! Asks the relay to listen on the public port and hands every
//! relay-initiated channel to its own bridge task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use rt_core::ForwardError;

use super::bridge::ConnectionBridge;
use super::session::{IncomingChannel, SshSession};
use crate::state::TunnelState;

/// How long `shutdown` waits for bridge tasks after cancelling them.
const BRIDGE_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The forward the relay actually set up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundPort {
    /// Bind address sent to the relay ("" means all interfaces)
    pub address: String,
    /// Port we asked for
    pub requested: u16,
    /// Port the relay bound
    pub port: u16,
}

/// Dispatches forwarded connections for one session
pub struct PortForwardListener {
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
}

impl PortForwardListener {
    /// Request `tcpip-forward` for `address:port` on the relay.
    ///
    /// On success the shared state becomes `ForwardingActive` with the
    /// port the relay reports, which may differ from `port` when the relay
    /// re-maps it.
    pub async fn request_forward(
        session: &mut SshSession,
        state: &TunnelState,
        address: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<BoundPort, ForwardError> {
        if session.is_closed() {
            return Err(ForwardError::SessionClosed);
        }

        tracing::debug!("Requesting remote forward {}:{}", display_bind(address), port);
        let bound = tokio::time::timeout(
            timeout,
            session.handle_mut().tcpip_forward(address, u32::from(port)),
        )
        .await
        .map_err(|_| ForwardError::Timeout(timeout))?
        .map_err(|e| match e {
            russh::Error::RequestDenied => ForwardError::Rejected {
                address: address.to_string(),
                port,
            },
            russh::Error::Disconnect | russh::Error::SendError => ForwardError::SessionClosed,
            other => ForwardError::Request(other.to_string()),
        })?;

        // Relays answer 0 when they bound exactly what was requested.
        let bound_port = match u16::try_from(bound) {
            Ok(0) => port,
            Ok(p) => p,
            Err(_) => {
                return Err(ForwardError::Request(format!(
                    "Relay reported invalid port {}",
                    bound
                )))
            }
        };

        if bound_port != port {
            tracing::info!("Relay re-mapped public port {} to {}", port, bound_port);
        }
        tracing::info!(
            "Remote forward active: {}:{} -> local service",
            display_bind(address),
            bound_port
        );
        state.mark_forwarding(bound_port);

        Ok(BoundPort {
            address: address.to_string(),
            requested: port,
            port: bound_port,
        })
    }

    /// Start accepting relay-initiated channels, bridging each one to
    /// `target` on its own task.
    ///
    /// `half_close_timeout` bounds how long a bridge may idle once one
    /// direction has finished.
    pub fn spawn(
        incoming: mpsc::UnboundedReceiver<IncomingChannel>,
        target: String,
        state: Arc<TunnelState>,
        half_close_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let tracker = TaskTracker::new();
        let accept_task = tokio::spawn(accept_loop(
            incoming,
            target,
            state,
            half_close_timeout,
            cancel.clone(),
            tracker.clone(),
        ));

        Self {
            cancel,
            tracker,
            accept_task,
        }
    }

    /// Number of bridge tasks still running
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting, cancel every bridge and wait for them to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.accept_task.await {
            tracing::warn!("Forward accept loop failed: {}", e);
        }

        self.tracker.close();
        if tokio::time::timeout(BRIDGE_SHUTDOWN_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                "{} bridge(s) still running after {:?}",
                self.tracker.len(),
                BRIDGE_SHUTDOWN_GRACE
            );
        }
    }
}

async fn accept_loop(
    mut incoming: mpsc::UnboundedReceiver<IncomingChannel>,
    target: String,
    state: Arc<TunnelState>,
    half_close_timeout: Duration,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = incoming.recv() => next,
        };

        let Some(incoming) = next else {
            tracing::debug!("Session stopped delivering forwarded channels");
            break;
        };

        let origin = incoming.origin();
        let bridge =
            ConnectionBridge::new(target.clone(), Arc::clone(&state), cancel.child_token())
                .with_half_close_timeout(half_close_timeout);
        tracker.spawn(async move {
            if let Err(e) = bridge.run(incoming.channel, &origin).await {
                tracing::debug!("Bridge for {} ended with error: {}", origin, e);
            }
        });
    }

    // Channels still queued were never bridged; refuse them.
    incoming.close();
    while let Ok(pending) = incoming.try_recv() {
        let _ = pending.channel.close().await;
    }
}

fn display_bind(address: &str) -> &str {
    if address.is_empty() {
        "*"
    } else {
        address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_bind_address_displays_as_wildcard() {
        assert_eq!(display_bind(""), "*");
        assert_eq!(display_bind("0.0.0.0"), "0.0.0.0");
    }

    #[tokio::test]
    async fn test_shutdown_without_channels() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let listener = PortForwardListener::spawn(
            rx,
            "127.0.0.1:1".into(),
            Arc::new(TunnelState::new()),
            Duration::from_secs(30),
            CancellationToken::new(),
        );
        assert_eq!(listener.active_tasks(), 0);
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_accept_loop_ends_when_session_drops_sender() {
        let (tx, rx) = mpsc::unbounded_channel::<IncomingChannel>();
        let listener = PortForwardListener::spawn(
            rx,
            "127.0.0.1:1".into(),
            Arc::new(TunnelState::new()),
            Duration::from_secs(30),
            CancellationToken::new(),
        );
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), listener.shutdown())
            .await
            .unwrap();
    }
}
