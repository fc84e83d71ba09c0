// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Heartbeat statistics.
//!
//! Counters are updated with single atomic operations from the sender,
//! receiver and expiry tasks; readers take a [`StatsSnapshot`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Live counters of one client connection.
#[derive(Debug)]
pub struct HeartbeatStats {
    sent: AtomicU64,
    lost: AtomicU64,
    acked: AtomicU64,
    unexpected: AtomicU64,
    invalid: AtomicU64,
    rtt_sum_ns: AtomicU64,
    rtt_min_ns: AtomicU64,
    rtt_max_ns: AtomicU64,
}

impl Default for HeartbeatStats {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatStats {
    pub fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            unexpected: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
            rtt_sum_ns: AtomicU64::new(0),
            rtt_min_ns: AtomicU64::new(u64::MAX),
            rtt_max_ns: AtomicU64::new(0),
        }
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lost(&self) {
        self.lost.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a matched ack with its reported (half round-trip) RTT.
    pub fn record_ack(&self, rtt: Duration) {
        let ns = u64::try_from(rtt.as_nanos()).unwrap_or(u64::MAX);
        self.acked.fetch_add(1, Ordering::Relaxed);
        self.rtt_sum_ns.fetch_add(ns, Ordering::Relaxed);
        self.rtt_min_ns.fetch_min(ns, Ordering::Relaxed);
        self.rtt_max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    /// Ack for an id that was not outstanding. Sent/lost are unaffected.
    pub fn record_unexpected(&self) {
        self.unexpected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn total_lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let total_sent = self.sent.load(Ordering::Relaxed);
        let total_lost = self.lost.load(Ordering::Relaxed);
        let total_acked = self.acked.load(Ordering::Relaxed);

        let (rtt_min_us, rtt_mean_us, rtt_max_us) = if total_acked == 0 {
            (0.0, 0.0, 0.0)
        } else {
            let sum = self.rtt_sum_ns.load(Ordering::Relaxed) as f64;
            (
                self.rtt_min_ns.load(Ordering::Relaxed) as f64 / 1_000.0,
                sum / total_acked as f64 / 1_000.0,
                self.rtt_max_ns.load(Ordering::Relaxed) as f64 / 1_000.0,
            )
        };

        StatsSnapshot {
            total_sent,
            total_lost,
            total_acked,
            unexpected_acks: self.unexpected.load(Ordering::Relaxed),
            invalid_messages: self.invalid.load(Ordering::Relaxed),
            loss_rate: loss_rate(total_sent, total_lost),
            rtt_min_us,
            rtt_mean_us,
            rtt_max_us,
        }
    }
}

/// Loss rate in percent; 0 when nothing was sent.
pub fn loss_rate(sent: u64, lost: u64) -> f64 {
    if sent == 0 {
        0.0
    } else {
        (lost as f64 * 100.0) / sent as f64
    }
}

/// Frozen copy of [`HeartbeatStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_sent: u64,
    pub total_lost: u64,
    pub total_acked: u64,
    pub unexpected_acks: u64,
    pub invalid_messages: u64,
    /// Percent of sent heartbeats that expired.
    pub loss_rate: f64,
    pub rtt_min_us: f64,
    pub rtt_mean_us: f64,
    pub rtt_max_us: f64,
}

impl StatsSnapshot {
    /// Heartbeats neither acked nor expired when the snapshot was taken.
    pub fn outstanding(&self) -> u64 {
        self.total_sent
            .saturating_sub(self.total_acked)
            .saturating_sub(self.total_lost)
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total heartbeats sent: {}", self.total_sent)?;
        writeln!(f, "Total packet loss: {}", self.total_lost)?;
        write!(f, "Packet loss rate: {:.2}%", self.loss_rate)
    }
}
