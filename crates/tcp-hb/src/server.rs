// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lossy heartbeat echo server.
//!
//! Every accepted connection gets its own handler task. Requests selected by
//! the [`DropPolicy`] are swallowed; the rest are echoed back with the same
//! id and timestamp and the kind rewritten to `Response`.

use crate::config::{ConfigError, ServerConfig};
use crate::connection::{ConnectionError, FrameReader, FrameWriter};
use crate::policy::{DropEveryNth, DropPolicy};
use crate::protocol::{self, HeartbeatMessage, MessageKind};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Heartbeat responder bound to a listening socket.
pub struct HeartbeatServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    policy: Arc<dyn DropPolicy>,
    stats: Arc<ServerStats>,
    running: AtomicBool,
}

impl HeartbeatServer {
    /// Bind with the drop policy described by `config.drop_every`.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let policy = Arc::new(DropEveryNth::new(config.drop_every));
        Self::bind_with_policy(config, policy).await
    }

    /// Bind with a custom drop policy.
    pub async fn bind_with_policy(
        config: ServerConfig,
        policy: Arc<dyn DropPolicy>,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let endpoint = config.listen_endpoint();
        let listener = TcpListener::bind(&endpoint)
            .await
            .map_err(|source| ServerError::Bind {
                endpoint: endpoint.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            policy,
            stats: Arc::new(ServerStats::default()),
            running: AtomicBool::new(false),
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current server counters.
    pub fn stats(&self) -> ServerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Check if the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Accept connections until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        info!("Server listening on {}", self.local_addr);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            info!("Accepted connection from {}", peer_addr);
                            self.stats.connections.fetch_add(1, Ordering::Relaxed);

                            let policy = self.policy.clone();
                            let stats = self.stats.clone();
                            let cancel = cancel.clone();

                            tokio::spawn(async move {
                                if let Err(e) =
                                    Self::handle_connection(stream, peer_addr, policy, stats, cancel).await
                                {
                                    warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Serve one connection until it closes or fails.
    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        policy: Arc<dyn DropPolicy>,
        stats: Arc<ServerStats>,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        let mut echoed = 0u64;
        let mut dropped = 0u64;

        loop {
            let msg = tokio::select! {
                result = reader.read_message() => match result {
                    Ok(Some(msg)) => msg,
                    Ok(None) => {
                        info!("Connection closed: {}", peer_addr);
                        break;
                    }
                    Err(e) if !e.is_fatal() => {
                        warn!("Discarding frame from {}: {}", peer_addr, e);
                        stats.invalid.fetch_add(1, Ordering::Relaxed);
                        dropped += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!("Error reading from {}: {}", peer_addr, e);
                        return Err(e.into());
                    }
                },
                _ = cancel.cancelled() => {
                    debug!("Connection handler shutting down: {}", peer_addr);
                    break;
                }
            };

            match process_message(msg, policy.as_ref(), &stats) {
                Some(reply) => {
                    writer.write_message(&reply).await?;
                    echoed += 1;
                }
                None => dropped += 1,
            }
        }

        debug!(
            "Connection {} done: {} echoed, {} unanswered",
            peer_addr, echoed, dropped
        );
        Ok(())
    }
}

/// Decide the reply for one inbound message; `None` means stay silent.
fn process_message(
    msg: HeartbeatMessage,
    policy: &dyn DropPolicy,
    stats: &ServerStats,
) -> Option<HeartbeatMessage> {
    if msg.kind != MessageKind::Request {
        warn!("Ignoring {:?} message: ID={}", msg.kind, msg.id);
        stats.invalid.fetch_add(1, Ordering::Relaxed);
        return None;
    }

    stats.requests.fetch_add(1, Ordering::Relaxed);
    let latency = protocol::unix_nanos().saturating_sub(msg.timestamp);
    info!(
        "Received heartbeat request: ID={}, latency={:?}",
        msg.id,
        Duration::from_nanos(u64::try_from(latency).unwrap_or(0))
    );

    if policy.should_drop(msg.id) {
        info!("Dropping heartbeat ID={}", msg.id);
        stats.dropped.fetch_add(1, Ordering::Relaxed);
        return None;
    }

    stats.echoed.fetch_add(1, Ordering::Relaxed);
    Some(msg.into_response())
}

/// Server-wide counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    connections: AtomicU64,
    requests: AtomicU64,
    echoed: AtomicU64,
    dropped: AtomicU64,
    invalid: AtomicU64,
}

impl ServerStats {
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            echoed: self.echoed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
        }
    }
}

/// Frozen copy of [`ServerStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatsSnapshot {
    /// Connections accepted.
    pub connections: u64,
    /// Valid requests received.
    pub requests: u64,
    /// Responses written.
    pub echoed: u64,
    /// Requests swallowed by the drop policy.
    pub dropped: u64,
    /// Frames that were not requests.
    pub invalid: u64,
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Error listening on {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::NeverDrop;
    use crate::protocol::{encode, MESSAGE_LEN};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_echo_keeps_id_and_timestamp() {
        let stats = ServerStats::default();
        let request = HeartbeatMessage::request(7);

        let reply = process_message(request, &NeverDrop, &stats).unwrap();
        assert_eq!(reply.kind, MessageKind::Response);
        assert_eq!(encode(&reply)[1..], encode(&request)[1..]);
        assert_eq!(stats.snapshot().echoed, 1);
    }

    #[test]
    fn test_default_policy_drops_fifth() {
        let stats = ServerStats::default();
        let policy = DropEveryNth::default();

        for id in 1..=10 {
            let reply = process_message(HeartbeatMessage::request(id), &policy, &stats);
            assert_eq!(reply.is_none(), id % 5 == 0, "id {}", id);
        }

        let snap = stats.snapshot();
        assert_eq!(snap.requests, 10);
        assert_eq!(snap.dropped, 2);
        assert_eq!(snap.echoed, 8);
    }

    #[test]
    fn test_response_kind_ignored() {
        let stats = ServerStats::default();

        let response = HeartbeatMessage::request(1).into_response();
        assert!(process_message(response, &NeverDrop, &stats).is_none());

        let snap = stats.snapshot();
        assert_eq!(snap.invalid, 1);
        assert_eq!(snap.requests, 0);
    }

    #[test]
    fn test_future_timestamp_does_not_panic() {
        let stats = ServerStats::default();
        let request = HeartbeatMessage {
            timestamp: i64::MAX,
            ..HeartbeatMessage::request(3)
        };
        assert!(process_message(request, &NeverDrop, &stats).is_some());
    }

    #[tokio::test]
    async fn test_unknown_tag_skipped_on_connection() {
        let server = Arc::new(
            HeartbeatServer::bind(ServerConfig {
                listen_address: "127.0.0.1".into(),
                port: 0,
                drop_every: 0,
            })
            .await
            .unwrap(),
        );
        let cancel = CancellationToken::new();
        let runner = server.clone();
        let stop = cancel.clone();
        tokio::spawn(async move { runner.run(stop).await });

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut garbage = encode(&HeartbeatMessage::request(1));
        garbage[0] = 9;
        stream.write_all(&garbage).await.unwrap();
        stream
            .write_all(&encode(&HeartbeatMessage::request(2)))
            .await
            .unwrap();

        let mut reply = [0u8; MESSAGE_LEN];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(protocol::decode(&reply).unwrap().id, 2);

        let snap = server.stats();
        assert_eq!(snap.invalid, 1);
        assert_eq!(snap.echoed, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let first = HeartbeatServer::bind(ServerConfig {
            listen_address: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        })
        .await
        .unwrap();

        let err = HeartbeatServer::bind(ServerConfig {
            listen_address: "127.0.0.1".into(),
            port: first.local_addr().port(),
            ..Default::default()
        })
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let server = HeartbeatServer::bind(ServerConfig {
            listen_address: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        })
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        server.run(cancel).await.unwrap();
        assert!(!server.is_running());
    }
}
