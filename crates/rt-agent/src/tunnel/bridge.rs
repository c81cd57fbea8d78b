//! Connection bridging
//!
//! Couples one relay-initiated SSH channel to one local TCP connection and
//! copies bytes both ways until both directions are finished, one side is
//! closed, or the tunnel is torn down.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rt_core::config::DEFAULT_HALF_CLOSE_TIMEOUT;
use rt_core::BridgeId;

use crate::metrics::TunnelMetrics;
use crate::state::TunnelState;

/// Read buffer per bridge.
const BRIDGE_BUFFER_SIZE: usize = 32 * 1024;

/// Chunks read from the local socket waiting for relay window.
const RELAY_QUEUE_DEPTH: usize = 32;

/// How long dialing the local service may take.
const LOCAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors local to one forwarded connection
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The local service could not be reached; the channel was rejected
    #[error("Failed to connect to local target {target}: {source}")]
    LocalDial {
        target: String,
        #[source]
        source: io::Error,
    },

    /// I/O failure while copying
    #[error("Bridge I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A message received on a relay channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMsg {
    /// Payload bytes
    Data(Bytes),
    /// The relay side will send no more data
    Eof,
    /// The relay closed the channel
    Close,
}

/// The relay side of a forwarded connection.
///
/// Implemented for russh client channels; tests substitute an in-memory
/// channel.
#[async_trait]
pub trait RelayChannel: Send {
    /// Next message from the relay, `None` once the channel is gone
    async fn next_message(&mut self) -> Option<RelayMsg>;

    /// Send payload bytes to the relay
    async fn write_data(&mut self, data: &[u8]) -> io::Result<()>;

    /// Tell the relay we will send no more data
    async fn write_eof(&mut self) -> io::Result<()>;

    /// Close the channel
    async fn shutdown(&mut self) -> io::Result<()>;
}

fn channel_error(e: russh::Error) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())
}

#[async_trait]
impl RelayChannel for Channel<Msg> {
    async fn next_message(&mut self) -> Option<RelayMsg> {
        loop {
            match self.wait().await? {
                ChannelMsg::Data { data } => {
                    return Some(RelayMsg::Data(Bytes::copy_from_slice(&data[..])))
                }
                ChannelMsg::Eof => return Some(RelayMsg::Eof),
                ChannelMsg::Close => return Some(RelayMsg::Close),
                // Window adjustments, extended data and requests are not
                // part of a forwarded TCP stream.
                _ => continue,
            }
        }
    }

    async fn write_data(&mut self, data: &[u8]) -> io::Result<()> {
        self.data(data).await.map_err(channel_error)
    }

    async fn write_eof(&mut self) -> io::Result<()> {
        self.eof().await.map_err(channel_error)
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.close().await.map_err(channel_error)
    }
}

/// One live forwarded connection
#[derive(Debug)]
pub struct ActiveBridge {
    id: BridgeId,
    origin: String,
    opened_at: Instant,
    bytes_relay_to_local: AtomicU64,
    bytes_local_to_relay: AtomicU64,
    closed: AtomicBool,
}

/// Point-in-time view of an [`ActiveBridge`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSnapshot {
    pub id: BridgeId,
    pub origin: String,
    pub age: Duration,
    pub bytes_relay_to_local: u64,
    pub bytes_local_to_relay: u64,
    pub closed: bool,
}

impl ActiveBridge {
    fn new(id: BridgeId, origin: String) -> Self {
        Self {
            id,
            origin,
            opened_at: Instant::now(),
            bytes_relay_to_local: AtomicU64::new(0),
            bytes_local_to_relay: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> BridgeId {
        self.id
    }

    /// Originator address reported by the relay
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn bytes_relay_to_local(&self) -> u64 {
        self.bytes_relay_to_local.load(Ordering::Relaxed)
    }

    pub fn bytes_local_to_relay(&self) -> u64 {
        self.bytes_local_to_relay.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> BridgeSnapshot {
        BridgeSnapshot {
            id: self.id,
            origin: self.origin.clone(),
            age: self.opened_at.elapsed(),
            bytes_relay_to_local: self.bytes_relay_to_local(),
            bytes_local_to_relay: self.bytes_local_to_relay(),
            closed: self.is_closed(),
        }
    }
}

/// Live bridges of a tunnel, keyed by id.
///
/// Only touched when a bridge opens or closes, never per byte.
pub struct BridgeRegistry {
    bridges: DashMap<BridgeId, Arc<ActiveBridge>>,
    next_id: AtomicU64,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self {
            bridges: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn register(&self, origin: String) -> Arc<ActiveBridge> {
        let id = BridgeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let bridge = Arc::new(ActiveBridge::new(id, origin));
        self.bridges.insert(id, Arc::clone(&bridge));
        bridge
    }

    fn remove(&self, id: BridgeId) {
        self.bridges.remove(&id);
    }

    /// Get a live bridge by id
    pub fn get(&self, id: BridgeId) -> Option<Arc<ActiveBridge>> {
        self.bridges.get(&id).map(|r| Arc::clone(&r))
    }

    /// Snapshots of all live bridges, ordered by id
    pub fn list(&self) -> Vec<BridgeSnapshot> {
        let mut list: Vec<_> = self.bridges.iter().map(|r| r.snapshot()).collect();
        list.sort_by_key(|b| b.id);
        list
    }

    /// Number of live bridges
    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    /// Check if no bridge is live
    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }
}

impl Default for BridgeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes a bridge from the registry when its task ends, however it ends.
struct Registration {
    state: Arc<TunnelState>,
    bridge: Arc<ActiveBridge>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.bridge.closed.store(true, Ordering::Release);
        self.state.bridges().remove(self.bridge.id);
    }
}

/// Why the copy loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    /// Both directions reached EOF
    Finished,
    /// The relay closed the channel
    RelayClosed,
    /// The remaining direction stayed idle after a half-close
    HalfCloseTimeout,
    /// The tunnel is being torn down
    Cancelled,
}

/// Bridges one relay channel to the local target
pub struct ConnectionBridge {
    target: String,
    state: Arc<TunnelState>,
    cancel: CancellationToken,
    half_close_timeout: Duration,
}

impl ConnectionBridge {
    /// Create a bridge to `target` (`host:port`).
    ///
    /// Cancelling `cancel` closes both sides of the bridge. Once one
    /// direction has finished, the other is closed after
    /// [`DEFAULT_HALF_CLOSE_TIMEOUT`] of inactivity unless overridden.
    pub fn new(
        target: impl Into<String>,
        state: Arc<TunnelState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            target: target.into(),
            state,
            cancel,
            half_close_timeout: DEFAULT_HALF_CLOSE_TIMEOUT,
        }
    }

    /// Override how long a half-closed bridge may stay idle
    pub fn with_half_close_timeout(mut self, timeout: Duration) -> Self {
        self.half_close_timeout = timeout;
        self
    }

    /// Dial the local target and copy bytes until the connection is done.
    ///
    /// A failed dial rejects the channel and returns
    /// [`BridgeError::LocalDial`]; the session is unaffected either way.
    pub async fn run<C: RelayChannel>(
        self,
        mut channel: C,
        origin: &str,
    ) -> Result<(), BridgeError> {
        let dial = tokio::time::timeout(LOCAL_CONNECT_TIMEOUT, TcpStream::connect(&self.target));
        let local = tokio::select! {
            _ = self.cancel.cancelled() => {
                let _ = channel.shutdown().await;
                return Ok(());
            }
            result = dial => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return self.reject(channel, origin, e).await,
                Err(_) => {
                    let e = io::Error::new(io::ErrorKind::TimedOut, "local connect timed out");
                    return self.reject(channel, origin, e).await;
                }
            }
        };

        if let Err(e) = local.set_nodelay(true) {
            tracing::warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let bridge = self.state.bridges().register(origin.to_string());
        let registration = Registration {
            state: Arc::clone(&self.state),
            bridge: Arc::clone(&bridge),
        };
        self.state.metrics().bridge_opened();
        tracing::info!("{} opened: {} -> {}", bridge.id(), origin, self.target);

        let result = self
            .pump(&mut channel, local, &bridge, self.state.metrics())
            .await;

        // The local socket is already dropped; close the channel too.
        let _ = channel.shutdown().await;
        drop(registration);

        let (up, down) = (bridge.bytes_relay_to_local(), bridge.bytes_local_to_relay());
        match result {
            Ok(end) => {
                tracing::info!(
                    "{} closed ({:?}): {} bytes in, {} bytes out",
                    bridge.id(),
                    end,
                    up,
                    down
                );
                Ok(())
            }
            Err(e) => {
                tracing::debug!(
                    "{} failed after {} bytes in, {} bytes out: {}",
                    bridge.id(),
                    up,
                    down,
                    e
                );
                Err(BridgeError::Io(e))
            }
        }
    }

    async fn reject<C: RelayChannel>(
        &self,
        mut channel: C,
        origin: &str,
        source: io::Error,
    ) -> Result<(), BridgeError> {
        tracing::warn!(
            "Rejecting forwarded connection from {}: local target {} unreachable: {}",
            origin,
            self.target,
            source
        );
        self.state.metrics().bridge_rejected();
        let _ = channel.shutdown().await;
        Err(BridgeError::LocalDial {
            target: self.target.clone(),
            source,
        })
    }

    async fn pump<C: RelayChannel>(
        &self,
        channel: &mut C,
        local: TcpStream,
        bridge: &ActiveBridge,
        metrics: &TunnelMetrics,
    ) -> io::Result<PumpEnd> {
        let (mut local_read, mut local_write) = local.into_split();
        let (to_relay_tx, mut to_relay_rx) = mpsc::channel::<Bytes>(RELAY_QUEUE_DEPTH);
        // Unbounded so the channel owner never waits on the local socket.
        let (to_local_tx, mut to_local_rx) = mpsc::unbounded_channel::<Bytes>();
        let id = bridge.id();

        let reader = async move {
            let mut buf = vec![0u8; BRIDGE_BUFFER_SIZE];
            loop {
                match local_read.read(&mut buf).await {
                    Ok(0) => {
                        tracing::debug!("{} local EOF", id);
                        break;
                    }
                    Ok(n) => {
                        if to_relay_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("{} local read error: {}", id, e);
                        break;
                    }
                }
            }
        };

        let writer = async move {
            while let Some(data) = to_local_rx.recv().await {
                if let Err(e) = local_write.write_all(&data).await {
                    tracing::debug!("{} local write error: {}", id, e);
                    return;
                }
                bridge
                    .bytes_relay_to_local
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                metrics.add_relay_to_local(data.len() as u64);
            }
            // Relay EOF: the service sees EOF but can keep answering.
            let _ = local_write.shutdown().await;
        };

        let relay = async move {
            let mut to_local_tx = Some(to_local_tx);
            let mut relay_open = true;
            let mut local_open = true;
            let mut idle_deadline = tokio::time::Instant::now();

            while relay_open || local_open {
                let half_closed = !(relay_open && local_open);

                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(PumpEnd::Cancelled),

                    _ = tokio::time::sleep_until(idle_deadline), if half_closed => {
                        return Ok(PumpEnd::HalfCloseTimeout);
                    }

                    msg = channel.next_message(), if relay_open => match msg {
                        Some(RelayMsg::Data(data)) => {
                            tracing::trace!("{} relay -> local {} bytes", id, data.len());
                            let delivered = to_local_tx
                                .as_ref()
                                .map(|tx| tx.send(data).is_ok())
                                .unwrap_or(false);
                            if !delivered {
                                return Err(io::Error::new(
                                    io::ErrorKind::BrokenPipe,
                                    "local socket closed",
                                ));
                            }
                        }
                        Some(RelayMsg::Eof) => {
                            tracing::debug!("{} relay EOF", id);
                            relay_open = false;
                            to_local_tx = None;
                        }
                        Some(RelayMsg::Close) | None => return Ok(PumpEnd::RelayClosed),
                    },

                    chunk = to_relay_rx.recv(), if local_open => match chunk {
                        Some(data) => {
                            channel.write_data(&data).await?;
                            bridge
                                .bytes_local_to_relay
                                .fetch_add(data.len() as u64, Ordering::Relaxed);
                            metrics.add_local_to_relay(data.len() as u64);
                            tracing::trace!("{} local -> relay {} bytes", id, data.len());
                        }
                        None => {
                            local_open = false;
                            channel.write_eof().await?;
                        }
                    },
                }

                // Activity (or the first half-close) pushes the idle deadline out.
                idle_deadline = tokio::time::Instant::now() + self.half_close_timeout;
            }

            Ok::<_, io::Error>(PumpEnd::Finished)
        };

        // The relay loop decides when the bridge is over; the local halves
        // are dropped with `reader` and `writer` when this function returns.
        tokio::pin!(relay);
        tokio::pin!(reader);
        tokio::pin!(writer);
        let mut reader_done = false;
        let mut writer_done = false;

        let end = loop {
            tokio::select! {
                end = &mut relay => break end,
                _ = &mut reader, if !reader_done => reader_done = true,
                _ = &mut writer, if !writer_done => writer_done = true,
            }
        };

        // The relay loop dropped its sender; flush what it already queued.
        if matches!(end, Ok(PumpEnd::Finished | PumpEnd::RelayClosed)) && !writer_done {
            let _ = tokio::time::timeout(self.half_close_timeout, &mut writer).await;
        }

        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    /// What the bridge sent towards the relay
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Outbound {
        Data(Vec<u8>),
        Eof,
        Close,
    }

    /// In-memory relay channel
    struct MockChannel {
        inbound: mpsc::UnboundedReceiver<RelayMsg>,
        outbound: mpsc::UnboundedSender<Outbound>,
    }

    /// The test's end of a [`MockChannel`]
    struct RelayEnd {
        pub tx: mpsc::UnboundedSender<RelayMsg>,
        pub rx: mpsc::UnboundedReceiver<Outbound>,
    }

    fn mock_channel() -> (MockChannel, RelayEnd) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            MockChannel {
                inbound: in_rx,
                outbound: out_tx,
            },
            RelayEnd {
                tx: in_tx,
                rx: out_rx,
            },
        )
    }

    #[async_trait]
    impl RelayChannel for MockChannel {
        async fn next_message(&mut self) -> Option<RelayMsg> {
            self.inbound.recv().await
        }

        async fn write_data(&mut self, data: &[u8]) -> io::Result<()> {
            self.outbound
                .send(Outbound::Data(data.to_vec()))
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
        }

        async fn write_eof(&mut self) -> io::Result<()> {
            let _ = self.outbound.send(Outbound::Eof);
            Ok(())
        }

        async fn shutdown(&mut self) -> io::Result<()> {
            let _ = self.outbound.send(Outbound::Close);
            Ok(())
        }
    }

    impl RelayEnd {
        fn send(&self, data: &[u8]) {
            self.tx.send(RelayMsg::Data(Bytes::copy_from_slice(data))).unwrap();
        }

        /// Collect data until `len` bytes arrived
        async fn read_exact(&mut self, len: usize) -> Vec<u8> {
            let mut out = Vec::new();
            while out.len() < len {
                match timeout(Duration::from_secs(5), self.rx.recv()).await {
                    Ok(Some(Outbound::Data(d))) => out.extend_from_slice(&d),
                    other => panic!("expected data, got {:?}", other),
                }
            }
            out
        }

        /// Wait for the bridge to close the channel, skipping data and EOF
        async fn wait_closed(&mut self) {
            loop {
                match timeout(Duration::from_secs(5), self.rx.recv()).await {
                    Ok(Some(Outbound::Close)) | Ok(None) => return,
                    Ok(Some(_)) => continue,
                    Err(_) => panic!("channel was not closed in time"),
                }
            }
        }
    }

    /// Local service that echoes everything back until the peer's EOF
    async fn spawn_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    /// An address nothing listens on
    async fn dead_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    fn spawn_bridge(
        target: &str,
        state: &Arc<TunnelState>,
        cancel: &CancellationToken,
    ) -> (RelayEnd, tokio::task::JoinHandle<Result<(), BridgeError>>) {
        let (channel, relay) = mock_channel();
        let bridge = ConnectionBridge::new(target, Arc::clone(state), cancel.child_token());
        let handle = tokio::spawn(async move { bridge.run(channel, "203.0.113.7:50000").await });
        (relay, handle)
    }

    #[tokio::test]
    async fn test_bytes_round_trip_in_order() {
        let target = spawn_echo_server().await;
        let state = Arc::new(TunnelState::new());
        let cancel = CancellationToken::new();
        let (mut relay, handle) = spawn_bridge(&target, &state, &cancel);

        relay.send(b"PING");
        assert_eq!(relay.read_exact(4).await, b"PING");

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        for chunk in payload.chunks(7_000) {
            relay.send(chunk);
        }
        assert_eq!(relay.read_exact(payload.len()).await, payload);

        relay.tx.send(RelayMsg::Close).unwrap();
        relay.wait_closed().await;
        handle.await.unwrap().unwrap();

        let metrics = state.metrics().snapshot();
        assert_eq!(metrics.bridges_opened, 1);
        assert_eq!(metrics.bytes_relay_to_local, payload.len() as u64 + 4);
        assert_eq!(metrics.bytes_local_to_relay, payload.len() as u64 + 4);
    }

    #[tokio::test]
    async fn test_concurrent_bridges_are_isolated() {
        let target = spawn_echo_server().await;
        let state = Arc::new(TunnelState::new());
        let cancel = CancellationToken::new();
        let (mut a, _ha) = spawn_bridge(&target, &state, &cancel);
        let (mut b, _hb) = spawn_bridge(&target, &state, &cancel);

        for _ in 0..50 {
            a.send(b"aaaa");
            b.send(b"bbbbbb");
        }

        let from_a = a.read_exact(200).await;
        let from_b = b.read_exact(300).await;
        assert!(from_a.iter().all(|&c| c == b'a'));
        assert!(from_b.iter().all(|&c| c == b'b'));

        assert_eq!(state.bridges().len(), 2);
        cancel.cancel();
        a.wait_closed().await;
        b.wait_closed().await;
    }

    #[tokio::test]
    async fn test_relay_eof_half_closes_then_finishes() {
        let target = spawn_echo_server().await;
        let state = Arc::new(TunnelState::new());
        let cancel = CancellationToken::new();
        let (mut relay, handle) = spawn_bridge(&target, &state, &cancel);

        relay.send(b"last words");
        relay.tx.send(RelayMsg::Eof).unwrap();

        // The echo service still answers after our EOF, then closes.
        assert_eq!(relay.read_exact(10).await, b"last words");
        assert_eq!(
            timeout(Duration::from_secs(5), relay.rx.recv()).await.unwrap(),
            Some(Outbound::Eof)
        );
        relay.wait_closed().await;
        handle.await.unwrap().unwrap();
        assert!(state.bridges().is_empty());
    }

    #[tokio::test]
    async fn test_local_close_closes_relay_channel() {
        // Service that hangs up right after accepting
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let state = Arc::new(TunnelState::new());
        let (channel, mut relay) = mock_channel();
        let bridge = ConnectionBridge::new(&target, Arc::clone(&state), CancellationToken::new())
            .with_half_close_timeout(Duration::from_millis(200));
        let handle = tokio::spawn(async move { bridge.run(channel, "origin").await });

        assert_eq!(
            timeout(Duration::from_secs(5), relay.rx.recv()).await.unwrap(),
            Some(Outbound::Eof)
        );
        relay.wait_closed().await;
        handle.await.unwrap().unwrap();
        assert!(state.bridges().is_empty());
    }

    #[tokio::test]
    async fn test_silent_service_is_closed_after_half_close_timeout() {
        // Service that keeps the socket open and never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(socket);
        });

        let state = Arc::new(TunnelState::new());
        let (channel, mut relay) = mock_channel();
        let bridge = ConnectionBridge::new(&target, Arc::clone(&state), CancellationToken::new())
            .with_half_close_timeout(Duration::from_millis(300));
        let handle = tokio::spawn(async move { bridge.run(channel, "origin").await });

        relay.tx.send(RelayMsg::Eof).unwrap();
        relay.wait_closed().await;
        timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(state.bridges().is_empty());
    }

    #[tokio::test]
    async fn test_relay_close_closes_local_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        let state = Arc::new(TunnelState::new());
        let cancel = CancellationToken::new();
        let (relay, handle) = spawn_bridge(&target, &state, &cancel);

        let (mut local, _) = listener.accept().await.unwrap();
        relay.tx.send(RelayMsg::Close).unwrap();

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(5), local.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_local_dial_failure_rejects_only_that_channel() {
        let live_target = spawn_echo_server().await;
        let dead_target = dead_address().await;
        let state = Arc::new(TunnelState::new());
        let cancel = CancellationToken::new();

        let (mut live, _live_handle) = spawn_bridge(&live_target, &state, &cancel);
        live.send(b"before");
        assert_eq!(live.read_exact(6).await, b"before");

        let (mut dead, dead_handle) = spawn_bridge(&dead_target, &state, &cancel);
        assert_eq!(
            timeout(Duration::from_secs(5), dead.rx.recv()).await.unwrap(),
            Some(Outbound::Close)
        );
        assert!(matches!(
            dead_handle.await.unwrap(),
            Err(BridgeError::LocalDial { .. })
        ));

        live.send(b"after");
        assert_eq!(live.read_exact(5).await, b"after");
        assert!(!cancel.is_cancelled());

        let metrics = state.metrics().snapshot();
        assert_eq!(metrics.bridges_opened, 1);
        assert_eq!(metrics.bridges_rejected, 1);
        assert_eq!(state.bridges().len(), 1);
    }

    #[tokio::test]
    async fn test_registry_tracks_live_bridge() {
        let target = spawn_echo_server().await;
        let state = Arc::new(TunnelState::new());
        let cancel = CancellationToken::new();
        let (mut relay, handle) = spawn_bridge(&target, &state, &cancel);

        relay.send(b"hello");
        relay.read_exact(5).await;

        let list = state.bridges().list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].origin, "203.0.113.7:50000");
        assert_eq!(list[0].bytes_relay_to_local, 5);
        assert!(!list[0].closed);
        let bridge = state.bridges().get(list[0].id).unwrap();

        cancel.cancel();
        relay.wait_closed().await;
        handle.await.unwrap().unwrap();
        assert!(bridge.is_closed());
        assert!(state.bridges().get(list[0].id).is_none());
    }
}
