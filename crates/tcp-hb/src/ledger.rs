// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pending-ack ledger.
//!
//! Maps each in-flight heartbeat id to the instant it was sent. The ack path
//! and the timeout path both settle an entry through [`PendingLedger::try_resolve`],
//! which removes and returns the entry in one step. Whichever caller gets
//! `Some` owns the outcome; the other sees `None` and must not count anything.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Instant;
use thiserror::Error;

/// Outstanding heartbeats of one connection.
#[derive(Debug, Default)]
pub struct PendingLedger {
    pending: DashMap<u32, Instant>,
}

impl PendingLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Record a sent heartbeat.
    pub fn insert(&self, id: u32, sent_at: Instant) -> Result<(), LedgerError> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => Err(LedgerError::Duplicate(id)),
            Entry::Vacant(slot) => {
                slot.insert(sent_at);
                Ok(())
            }
        }
    }

    /// Take the entry for `id` if it is still outstanding.
    ///
    /// Check-and-delete happens under the shard lock, so for a given id at
    /// most one caller ever receives `Some`.
    pub fn try_resolve(&self, id: u32) -> Option<Instant> {
        self.pending.remove(&id).map(|(_, sent_at)| sent_at)
    }

    /// Number of outstanding heartbeats.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Discard every outstanding entry without resolving it.
    ///
    /// Used at connection teardown. Returns how many entries were dropped.
    pub fn clear(&self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        discarded
    }
}

/// Ledger error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Heartbeat {0} is already outstanding")]
    Duplicate(u32),
}
