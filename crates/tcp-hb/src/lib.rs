// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP heartbeat probe
//!
//! Measures connection liveness and round-trip latency over a persistent TCP
//! stream using a fixed 13-byte binary heartbeat.
//!
//! - [`HeartbeatClient`] sends numbered requests on a fixed interval, matches
//!   acknowledgments against its [`PendingLedger`], and reports RTT and loss.
//! - [`HeartbeatServer`] echoes requests back, except those its
//!   [`DropPolicy`] chooses to swallow.
//!
//! # Quick Start
//!
//! ```bash
//! # Lossy echo server (drops every 5th heartbeat)
//! tcp-hb server --listen 0.0.0.0 --port 8080
//!
//! # Client: one heartbeat per second, 5s loss timeout
//! tcp-hb client --server 127.0.0.1 --port 8080 --interval 1 --timeout 5
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod ledger;
pub mod policy;
pub mod protocol;
pub mod server;
pub mod stats;

pub use client::{ClientError, ClientState, HeartbeatClient, HeartbeatEvent};
pub use config::{ClientConfig, ConfigError, ServerConfig};
pub use connection::{ConnectionError, FrameReader, FrameWriter};
pub use ledger::{LedgerError, PendingLedger};
pub use policy::{DropEveryNth, DropPolicy, NeverDrop};
pub use protocol::{HeartbeatMessage, MessageKind, ProtocolError, MESSAGE_LEN};
pub use server::{HeartbeatServer, ServerError, ServerStatsSnapshot};
pub use stats::{HeartbeatStats, StatsSnapshot};
