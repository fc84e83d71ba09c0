// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Heartbeat client engine.
//!
//! One connection runs three activities sharing a [`PendingLedger`] and
//! [`HeartbeatStats`]:
//!
//! - the sender, on the engine's own task, emitting a numbered request every
//!   `interval`;
//! - the receiver task, matching responses against the ledger;
//! - the expiry task, declaring heartbeats lost once `timeout` elapses.
//!
//! The timeout is identical for every heartbeat, so deadlines are queued in
//! send order and a single FIFO expiry task serves them all. Ack and expiry
//! race through [`PendingLedger::try_resolve`]; only the winner counts.
//!
//! State machine: `Connecting -> Running -> Draining -> Closed`.

use crate::config::{ClientConfig, ConfigError};
use crate::connection::{ConnectionError, FrameReader, FrameWriter};
use crate::ledger::{LedgerError, PendingLedger};
use crate::protocol::{HeartbeatMessage, MessageKind, ProtocolError};
use crate::stats::{HeartbeatStats, StatsSnapshot};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Running,
    Draining,
    Closed,
}

/// Observable engine events, mirrored to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Request written to the transport.
    Sent { id: u32 },
    /// Matching response; `rtt` is half the measured round trip.
    Acked { id: u32, rtt: Duration },
    /// Timeout elapsed before any response.
    Lost { id: u32 },
    /// Response for an id that was not outstanding.
    Unexpected { id: u32 },
    /// Frame that is not a valid response.
    Invalid { tag: u8 },
}

/// Heartbeat client.
pub struct HeartbeatClient {
    config: Arc<ClientConfig>,
    ctx: EngineContext,
    state: Arc<Mutex<ClientState>>,
}

/// State shared by the sender, receiver and expiry tasks.
#[derive(Clone)]
struct EngineContext {
    ledger: Arc<PendingLedger>,
    stats: Arc<HeartbeatStats>,
    resolved: Arc<Notify>,
    events: Option<mpsc::UnboundedSender<HeartbeatEvent>>,
}

struct Expiry {
    id: u32,
    deadline: Instant,
}

impl HeartbeatClient {
    /// Create a client for the configured server.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;

        Ok(Self {
            config: Arc::new(config),
            ctx: EngineContext {
                ledger: Arc::new(PendingLedger::new()),
                stats: Arc::new(HeartbeatStats::new()),
                resolved: Arc::new(Notify::new()),
                events: None,
            },
            state: Arc::new(Mutex::new(ClientState::Connecting)),
        })
    }

    /// Forward every engine event to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<HeartbeatEvent>) -> Self {
        self.ctx.events = Some(tx);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    /// Current statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Heartbeats awaiting an ack or their timeout.
    pub fn outstanding(&self) -> usize {
        self.ctx.ledger.len()
    }

    /// Connect to the configured server and run until shutdown.
    ///
    /// Returns the final statistics when `cancel` fires (or the heartbeat
    /// budget is spent); a broken connection is returned as an error.
    pub async fn connect(&self, cancel: CancellationToken) -> Result<StatsSnapshot, ClientError> {
        let endpoint = self.config.server_endpoint();
        info!("Connecting to {}", endpoint);

        let stream = tokio::select! {
            result = TcpStream::connect(&endpoint) => match result {
                Ok(stream) => stream,
                Err(source) => {
                    self.set_state(ClientState::Closed);
                    return Err(ClientError::Connect { endpoint, source });
                }
            },
            _ = cancel.cancelled() => {
                info!("Shutdown before connection was established");
                self.set_state(ClientState::Closed);
                return Ok(self.stats());
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        match stream.peer_addr() {
            Ok(peer) => info!("Connected to server {}", peer),
            Err(_) => info!("Connected to server {}", endpoint),
        }

        self.run(stream, cancel).await
    }

    /// Run the heartbeat engine over an established byte stream.
    pub async fn run<S>(&self, stream: S, cancel: CancellationToken) -> Result<StatsSnapshot, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if *state != ClientState::Connecting {
                return Err(ClientError::AlreadyStarted);
            }
            *state = ClientState::Running;
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let mut writer = FrameWriter::new(write_half);

        let mut receiver = tokio::spawn(receive_loop(
            FrameReader::new(read_half),
            self.ctx.clone(),
            self.config.read_timeout(),
        ));
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let expiry = tokio::spawn(expire_loop(expiry_rx, self.ctx.clone()));

        let outcome = self
            .send_loop(&mut writer, &mut receiver, &expiry_tx, &cancel)
            .await;

        self.set_state(ClientState::Draining);
        receiver.abort();
        expiry.abort();
        if outcome.is_ok() {
            if let Err(e) = writer.shutdown().await {
                debug!("Failed to shutdown connection: {}", e);
            }
        }

        let discarded = self.ctx.ledger.clear();
        if discarded > 0 {
            debug!("Discarded {} unresolved heartbeats", discarded);
        }

        let snapshot = self.ctx.stats.snapshot();
        info!(
            sent = snapshot.total_sent,
            lost = snapshot.total_lost,
            acked = snapshot.total_acked,
            "Final statistics: loss rate {:.2}%",
            snapshot.loss_rate
        );

        self.set_state(ClientState::Closed);
        outcome.map(|()| snapshot)
    }

    async fn send_loop<W>(
        &self,
        writer: &mut FrameWriter<W>,
        receiver: &mut JoinHandle<ClientError>,
        expiry_tx: &mpsc::UnboundedSender<Expiry>,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        let interval = self.config.interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut next_id: u32 = 0;
        let mut sent: u64 = 0;

        loop {
            if self.config.max_heartbeats.is_some_and(|max| sent >= max) {
                return self.drain_outstanding(receiver, cancel).await;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown signal received, stopping heartbeats");
                    return Ok(());
                }
                result = &mut *receiver => return Err(receiver_exit(result)),
                _ = ticker.tick() => {
                    next_id = next_id.wrapping_add(1);
                    self.send_heartbeat(writer, next_id, expiry_tx).await?;
                    sent += 1;
                }
            }
        }
    }

    async fn send_heartbeat<W>(
        &self,
        writer: &mut FrameWriter<W>,
        id: u32,
        expiry_tx: &mpsc::UnboundedSender<Expiry>,
    ) -> Result<(), ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        let msg = HeartbeatMessage::request(id);
        let sent_at = std::time::Instant::now();

        // Registered before the write so an immediate ack always finds it.
        self.ctx.ledger.insert(id, sent_at)?;
        if let Err(e) = writer.write_message(&msg).await {
            error!("Failed to send heartbeat {}: {}", id, e);
            self.ctx.ledger.try_resolve(id);
            return Err(e.into());
        }

        self.ctx.stats.record_sent();
        debug!("Sent heartbeat request: ID={}", id);
        self.ctx.emit(HeartbeatEvent::Sent { id });

        // The receiving end only goes away during teardown.
        let _ = expiry_tx.send(Expiry {
            id,
            deadline: Instant::from_std(sent_at) + self.config.timeout(),
        });
        Ok(())
    }

    /// Wait until every outstanding heartbeat is acked or expired.
    async fn drain_outstanding(
        &self,
        receiver: &mut JoinHandle<ClientError>,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        info!(
            "Heartbeat budget reached, waiting on {} outstanding",
            self.ctx.ledger.len()
        );

        loop {
            if self.ctx.ledger.is_empty() {
                return Ok(());
            }

            tokio::select! {
                _ = self.ctx.resolved.notified() => {}
                _ = cancel.cancelled() => return Ok(()),
                result = &mut *receiver => return Err(receiver_exit(result)),
            }
        }
    }

    fn set_state(&self, next: ClientState) {
        let mut state = self.state.lock();
        trace!("Client state {:?} -> {:?}", *state, next);
        *state = next;
    }
}

impl EngineContext {
    fn emit(&self, event: HeartbeatEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn on_response(&self, id: u32) {
        match self.ledger.try_resolve(id) {
            Some(sent_at) => {
                let rtt = sent_at.elapsed() / 2;
                self.stats.record_ack(rtt);
                info!("Received valid heartbeat response: ID={}, RTT={:?}", id, rtt);
                self.emit(HeartbeatEvent::Acked { id, rtt });
                self.resolved.notify_one();
            }
            None => {
                self.stats.record_unexpected();
                warn!("Received unexpected heartbeat response: ID={}", id);
                self.emit(HeartbeatEvent::Unexpected { id });
            }
        }
    }

    fn on_expired(&self, id: u32) {
        if self.ledger.try_resolve(id).is_some() {
            self.stats.record_lost();
            warn!("Packet loss or timeout for ID={}", id);
            self.emit(HeartbeatEvent::Lost { id });
            self.resolved.notify_one();
        }
    }

    fn on_invalid(&self, tag: u8) {
        self.stats.record_invalid();
        warn!("Received invalid message type {}", tag);
        self.emit(HeartbeatEvent::Invalid { tag });
    }
}

/// Receiver task. Only returns once the connection is unusable.
async fn receive_loop<R>(
    mut reader: FrameReader<R>,
    ctx: EngineContext,
    read_timeout: Duration,
) -> ClientError
where
    R: AsyncRead + Unpin,
{
    loop {
        match tokio::time::timeout(read_timeout, reader.read_message()).await {
            Err(_) => trace!("No response within {:?}", read_timeout),
            Ok(Ok(Some(msg))) if msg.kind == MessageKind::Response => ctx.on_response(msg.id),
            Ok(Ok(Some(msg))) => ctx.on_invalid(msg.kind.tag()),
            Ok(Ok(None)) => {
                warn!("Server closed the connection");
                return ClientError::Disconnected;
            }
            Ok(Err(ConnectionError::Protocol(ProtocolError::MalformedMessage { kind }))) => {
                ctx.on_invalid(kind)
            }
            Ok(Err(e)) if !e.is_fatal() => debug!("Discarding frame: {}", e),
            Ok(Err(e)) => {
                error!("Server stopped responding: {}", e);
                return ClientError::Transport(e);
            }
        }
    }
}

/// Expiry task: deadlines arrive in increasing order.
async fn expire_loop(mut queue: mpsc::UnboundedReceiver<Expiry>, ctx: EngineContext) {
    while let Some(Expiry { id, deadline }) = queue.recv().await {
        tokio::time::sleep_until(deadline).await;
        ctx.on_expired(id);
    }
}

fn receiver_exit(result: Result<ClientError, JoinError>) -> ClientError {
    result.unwrap_or_else(|e| ClientError::Task(e.to_string()))
}

/// Client error types.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] ConnectionError),

    #[error("Server closed the connection")]
    Disconnected,

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Client already started")]
    AlreadyStarted,

    #[error("Task failed: {0}")]
    Task(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{self, encode, MESSAGE_LEN, TAG_RESPONSE};
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};

    /// Stream that never yields data and rejects every write.
    struct BrokenWrite;

    impl AsyncRead for BrokenWrite {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenWrite {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn fast_config() -> ClientConfig {
        ClientConfig {
            interval_ms: 10,
            timeout_ms: 200,
            read_timeout_ms: 50,
            ..Default::default()
        }
    }

    async fn read_request(peer: &mut DuplexStream) -> [u8; MESSAGE_LEN] {
        let mut buf = [0u8; MESSAGE_LEN];
        peer.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = ClientConfig {
            interval_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            HeartbeatClient::new(config),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn test_initial_state() {
        let client = HeartbeatClient::new(ClientConfig::default()).unwrap();
        assert_eq!(client.state(), ClientState::Connecting);
        assert_eq!(client.stats().total_sent, 0);
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_ids_start_at_one_and_increment() {
        let client = HeartbeatClient::new(ClientConfig {
            max_heartbeats: Some(3),
            ..fast_config()
        })
        .unwrap();
        let (local, mut peer) = tokio::io::duplex(1024);

        let responder = tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..3 {
                let mut frame = read_request(&mut peer).await;
                ids.push(protocol::decode(&frame).unwrap().id);
                frame[0] = TAG_RESPONSE;
                peer.write_all(&frame).await.unwrap();
            }
            (ids, peer)
        });

        let snapshot = client.run(local, CancellationToken::new()).await.unwrap();
        let (ids, _peer) = responder.await.unwrap();

        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(snapshot.total_sent, 3);
        assert_eq!(snapshot.total_acked, 3);
        assert_eq!(snapshot.total_lost, 0);
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn test_unanswered_heartbeat_is_lost_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = HeartbeatClient::new(ClientConfig {
            max_heartbeats: Some(1),
            timeout_ms: 50,
            ..fast_config()
        })
        .unwrap()
        .with_events(tx);
        let (local, mut peer) = tokio::io::duplex(1024);

        let responder = tokio::spawn(async move {
            let frame = read_request(&mut peer).await;
            // Answer only after the timeout fired; the expiry already won.
            tokio::time::sleep(Duration::from_millis(120)).await;
            let mut late = frame;
            late[0] = TAG_RESPONSE;
            let _ = peer.write_all(&late).await;
            peer
        });

        let snapshot = client.run(local, CancellationToken::new()).await.unwrap();
        let _peer = responder.await.unwrap();

        assert_eq!(snapshot.total_sent, 1);
        assert_eq!(snapshot.total_lost, 1);
        assert_eq!(snapshot.total_acked, 0);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![HeartbeatEvent::Sent { id: 1 }, HeartbeatEvent::Lost { id: 1 }]
        );
    }

    #[tokio::test]
    async fn test_cancel_reports_and_closes() {
        let client = HeartbeatClient::new(fast_config()).unwrap();
        let (local, _peer) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(55)).await;
            trigger.cancel();
        });

        let snapshot = client.run(local, cancel).await.unwrap();
        assert!(snapshot.total_sent >= 1);
        assert_eq!(client.state(), ClientState::Closed);
        // Unresolved heartbeats are dropped at teardown.
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_first_tick() {
        let client = HeartbeatClient::new(ClientConfig::default()).unwrap();
        let (local, _peer) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let snapshot = client.run(local, cancel).await.unwrap();
        assert_eq!(snapshot.total_sent, 0);
        assert_eq!(snapshot.loss_rate, 0.0);
    }

    #[tokio::test]
    async fn test_peer_close_is_transport_failure() {
        let client = HeartbeatClient::new(fast_config()).unwrap();
        let (local, peer) = tokio::io::duplex(64);
        drop(peer);

        let err = client
            .run(local, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Disconnected | ClientError::Transport(_)
        ));
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn test_write_failure_ends_run() {
        let client = HeartbeatClient::new(fast_config()).unwrap();

        let err = client
            .run(BrokenWrite, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport(ConnectionError::Io(_))));
        assert_eq!(client.state(), ClientState::Closed);
        // Nothing stays outstanding and nothing counts as sent.
        assert_eq!(client.outstanding(), 0);
        assert_eq!(client.stats().total_sent, 0);
    }

    #[tokio::test]
    async fn test_run_twice_rejected() {
        let client = HeartbeatClient::new(fast_config()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (local, _peer) = tokio::io::duplex(64);
        client.run(local, cancel.clone()).await.unwrap();

        let (local, _peer) = tokio::io::duplex(64);
        assert!(matches!(
            client.run(local, cancel).await,
            Err(ClientError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_request_carries_wall_clock() {
        let client = HeartbeatClient::new(ClientConfig {
            max_heartbeats: Some(1),
            ..fast_config()
        })
        .unwrap();
        let (local, mut peer) = tokio::io::duplex(1024);
        let before = protocol::unix_nanos();

        let responder = tokio::spawn(async move {
            let frame = read_request(&mut peer).await;
            let msg = protocol::decode(&frame).unwrap();
            peer.write_all(&encode(&msg.into_response())).await.unwrap();
            (msg, peer)
        });

        client.run(local, CancellationToken::new()).await.unwrap();
        let (msg, _peer) = responder.await.unwrap();
        assert_eq!(msg.kind, MessageKind::Request);
        assert!(msg.timestamp >= before);
    }
}
