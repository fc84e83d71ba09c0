// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server-side drop policies.
//!
//! The responder consults a [`DropPolicy`] for every request and silently
//! discards the ones it selects, simulating packet loss on the client side.

/// Decides which heartbeat requests go unanswered.
pub trait DropPolicy: Send + Sync {
    fn should_drop(&self, id: u32) -> bool;
}

impl<F> DropPolicy for F
where
    F: Fn(u32) -> bool + Send + Sync,
{
    fn should_drop(&self, id: u32) -> bool {
        self(id)
    }
}

/// Drops every n-th identifier (`id % n == 0`). `n == 0` never drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropEveryNth {
    n: u32,
}

/// Modulus of the default policy.
pub const DEFAULT_DROP_EVERY: u32 = 5;

impl DropEveryNth {
    pub fn new(n: u32) -> Self {
        Self { n }
    }
}

impl Default for DropEveryNth {
    fn default() -> Self {
        Self::new(DEFAULT_DROP_EVERY)
    }
}

impl DropPolicy for DropEveryNth {
    fn should_drop(&self, id: u32) -> bool {
        self.n != 0 && id.is_multiple_of(self.n)
    }
}

/// Answers everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverDrop;

impl DropPolicy for NeverDrop {
    fn should_drop(&self, _id: u32) -> bool {
        false
    }
}
