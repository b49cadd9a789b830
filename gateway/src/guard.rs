//! In-memory replay and throughput protection.
//!
//! Both maps are `DashMap`s: read-modify-write on one key holds that key's
//! shard lock, and `retain` sweeps lock shard by shard, so a sweep never races
//! destructively with a concurrent insert.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hlchat_common::Address;
use tokio::time::Instant;

/// Remembers consumed nonces for `ttl`, inclusive of the final instant.
pub struct NonceGuard {
    seen: DashMap<String, Instant>,
    ttl: Duration,
}

impl NonceGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
        }
    }

    /// Consume `nonce`. Returns `false` if it was already consumed within the TTL.
    pub fn try_record(&self, nonce: &str) -> bool {
        let now = Instant::now();
        match self.seen.entry(nonce.to_string()) {
            Entry::Occupied(mut slot) => {
                if now.duration_since(*slot.get()) <= self.ttl {
                    return false;
                }
                // Expired but not yet swept.
                slot.insert(now);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    /// Drop nonces older than the TTL. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.seen.len();
        self.seen
            .retain(|_, inserted| now.duration_since(*inserted) <= self.ttl);
        before.saturating_sub(self.seen.len())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started: Instant,
    count: u32,
}

/// Fixed-window counter per address.
///
/// A window opens at an address's first event and closes `window` later;
/// bursts straddling a boundary can reach twice the limit.
pub struct RateGuard {
    windows: DashMap<Address, RateWindow>,
    limit: u32,
    window: Duration,
}

impl RateGuard {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            limit: limit.max(1),
            window,
        }
    }

    /// Count one event for `address`. Returns `false` once the window is full.
    pub fn try_acquire(&self, address: &Address) -> bool {
        let now = Instant::now();
        let mut entry = self.windows.entry(*address).or_insert(RateWindow {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            *entry = RateWindow {
                started: now,
                count: 0,
            };
        }
        if entry.count >= self.limit {
            return false;
        }
        entry.count += 1;
        true
    }

    pub fn count_for(&self, address: &Address) -> u32 {
        self.windows.get(address).map(|w| w.count).unwrap_or(0)
    }

    /// Drop windows that have already closed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.duration_since(w.started) < self.window);
        before.saturating_sub(self.windows.len())
    }
}
