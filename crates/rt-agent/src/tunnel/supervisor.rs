//! Reconnect supervisor
//!
//! Owns the tunnel for the lifetime of the hosting process:
//! `Idle -> Connecting -> Active -> (on loss) Connecting -> ... -> Stopped`.
//! A session is always fully torn down before the next one is attempted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use rt_core::{ConfigError, SessionState, SupervisorState, TunnelConfig, TunnelError};

use super::connector::{Connector, SshConnector, Tunnel};
use super::reconnect::ReconnectPolicy;
use crate::state::TunnelState;

/// Upper bound on how long `stop` waits for the tunnel to tear down.
const STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// Keeps one tunnel alive until stopped
pub struct ReconnectSupervisor<C: Connector> {
    inner: Arc<Inner<C>>,
    policy: Mutex<Option<ReconnectPolicy>>,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner<C: Connector> {
    connector: C,
    tunnel_state: Arc<TunnelState>,
    state: watch::Sender<SupervisorState>,
    stop: CancellationToken,
}

impl ReconnectSupervisor<SshConnector> {
    /// Build the SSH supervisor for `config`
    pub fn from_config(config: TunnelConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let tunnel_state = Arc::new(TunnelState::new());
        let policy = ReconnectPolicy::from_config(&config);
        let connector = SshConnector::new(Arc::new(config), Arc::clone(&tunnel_state));
        Ok(Self::new(connector, tunnel_state, policy))
    }
}

impl<C: Connector> ReconnectSupervisor<C> {
    pub fn new(connector: C, tunnel_state: Arc<TunnelState>, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Self {
            inner: Arc::new(Inner {
                connector,
                tunnel_state,
                state,
                stop: CancellationToken::new(),
            }),
            policy: Mutex::new(Some(policy)),
            run_task: Mutex::new(None),
        }
    }

    /// Bring the tunnel up.
    ///
    /// The first attempt runs inline. An authentication failure on that
    /// attempt is returned and leaves the supervisor `Stopped`; any other
    /// failure returns `Ok(())` and the supervisor keeps retrying in the
    /// background until [`stop`](Self::stop).
    pub async fn start(&self) -> Result<(), TunnelError> {
        let claimed = self.inner.state.send_if_modified(|state| {
            if *state == SupervisorState::Idle {
                *state = SupervisorState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            tracing::warn!("Tunnel supervisor already {}, ignoring start", self.state());
            return Ok(());
        }
        let Some(policy) = self.policy.lock().await.take() else {
            return Ok(());
        };

        // Held until the first attempt is settled so a concurrent `stop`
        // waits for it.
        let mut run_task = self.run_task.lock().await;

        tracing::info!("Starting tunnel supervisor");
        let first = tokio::select! {
            biased;
            result = self.inner.connector.connect() => result,
            _ = self.inner.stop.cancelled() => return Ok(()),
        };

        let tunnel = match first {
            Ok(tunnel) => Some(tunnel),
            Err(e) if e.is_auth_failure() => {
                tracing::error!("Authentication failed on initial connection: {}", e);
                self.inner.set_state(SupervisorState::Stopped);
                return Err(e);
            }
            Err(e) => {
                tracing::warn!("Initial connection failed: {}. Retrying in background", e);
                None
            }
        };

        if self.inner.stop.is_cancelled() {
            if let Some(tunnel) = tunnel {
                tunnel.shutdown().await;
            }
            return Ok(());
        }
        if tunnel.is_some() {
            self.inner.set_state(SupervisorState::Active);
        }

        let inner = Arc::clone(&self.inner);
        *run_task = Some(tokio::spawn(inner.run(tunnel, policy)));
        Ok(())
    }

    /// Stop reconnecting and tear the tunnel down.
    ///
    /// Safe to call any number of times, before `start` or after it.
    pub async fn stop(&self) {
        self.inner.stop.cancel();

        let run_task = self.run_task.lock().await.take();
        if let Some(handle) = run_task {
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Tunnel supervisor task failed: {}", e),
                Err(_) => tracing::warn!("Tunnel did not shut down within {:?}", STOP_TIMEOUT),
            }
        }

        let previous = self.inner.state.send_replace(SupervisorState::Stopped);
        if previous != SupervisorState::Stopped {
            tracing::info!("Tunnel supervisor stopped");
        }
        self.inner
            .tunnel_state
            .set_session_state(SessionState::Disconnected);
    }

    /// Whether the tunnel is currently up
    pub fn is_active(&self) -> bool {
        self.state() == SupervisorState::Active
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.state.borrow()
    }

    /// Watch supervisor state transitions
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.inner.state.subscribe()
    }

    /// Session state, live bridges and counters
    pub fn tunnel_state(&self) -> &Arc<TunnelState> {
        &self.inner.tunnel_state
    }
}

impl<C: Connector> Inner<C> {
    /// Publish a transition. `Stopped` is final.
    fn set_state(&self, next: SupervisorState) {
        self.state.send_if_modified(|state| {
            if *state == SupervisorState::Stopped || *state == next {
                return false;
            }
            tracing::debug!("Supervisor state {} -> {}", state, next);
            *state = next;
            true
        });
    }

    async fn run(self: Arc<Self>, mut tunnel: Option<C::Tunnel>, mut policy: ReconnectPolicy) {
        let mut attempt: u64 = 0;

        loop {
            if let Some(active) = tunnel.take() {
                policy.reset();
                attempt = 0;

                let stopped = tokio::select! {
                    _ = self.stop.cancelled() => true,
                    _ = active.closed() => false,
                };
                if stopped {
                    active.shutdown().await;
                    break;
                }

                tracing::warn!("Tunnel on port {} lost", active.bound_port());
                self.set_state(SupervisorState::Connecting);
                active.shutdown().await;
            }

            let delay = policy.next_delay();
            tracing::info!("Reconnecting in {:?}", delay);
            let stopped = tokio::select! {
                _ = self.stop.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if stopped {
                break;
            }

            attempt += 1;
            let result = tokio::select! {
                _ = self.stop.cancelled() => None,
                result = self.connector.connect() => Some(result),
            };
            let Some(result) = result else {
                break;
            };

            match result {
                Ok(next) => {
                    if self.stop.is_cancelled() {
                        next.shutdown().await;
                        break;
                    }
                    tracing::info!("Reconnected after {} attempt(s)", attempt);
                    self.set_state(SupervisorState::Active);
                    tunnel = Some(next);
                }
                Err(e) if e.is_auth_failure() => {
                    tracing::error!("Reconnect attempt {} failed authentication: {}", attempt, e);
                }
                Err(e) => {
                    tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                }
            }
        }

        tracing::debug!("Supervisor loop finished");
    }
}
