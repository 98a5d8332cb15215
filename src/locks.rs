//! # Per-Key Locks
//!
//! Hash-sharded lock table for composite keys. Each shard tracks the keys
//! currently held and a condition variable that wakes waiters when one of
//! them is released. Holding a key never blocks callers working on other keys;
//! the shard mutex is only taken for the bookkeeping around acquire/release.
//!
//! Default: 64 shards (2^6)

use crate::model::CompositeKey;
use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Exclusive per-key lock provider.
pub trait KeyLocker: Send + Sync {
    /// Take the lock for `key`, waiting at most `wait`. Returns `false` on timeout.
    fn try_lock_for(&self, key: &CompositeKey, wait: Duration) -> bool;

    /// Release a lock previously taken with [`KeyLocker::try_lock_for`].
    fn unlock(&self, key: &CompositeKey);
}

/// Largest accepted shard bit count; larger values are clamped.
pub const MAX_SHARD_BITS: u8 = 16;

/// Configuration for the sharded lock table
#[derive(Debug, Clone)]
pub struct KeyLockConfig {
    /// Number of shard bits (shards = 2^shard_bits)
    pub shard_bits: u8,
}

impl Default for KeyLockConfig {
    fn default() -> Self {
        Self { shard_bits: 6 }
    }
}

impl KeyLockConfig {
    #[inline]
    pub fn num_shards(&self) -> usize {
        1 << self.shard_bits.min(MAX_SHARD_BITS)
    }
}

/// Counters for lock activity
#[derive(Debug, Default)]
pub struct LockStats {
    pub acquired: AtomicU64,
    pub contended: AtomicU64,
    pub timed_out: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LockStatsSnapshot {
    pub acquired: u64,
    pub contended: u64,
    pub timed_out: u64,
}

struct LockShard {
    held: Mutex<HashSet<CompositeKey>>,
    released: Condvar,
}

impl LockShard {
    fn new() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }
}

/// In-process lock table sharded by key hash.
pub struct ShardedKeyLocks {
    shards: Vec<LockShard>,
    shard_mask: usize,
    stats: LockStats,
}

impl ShardedKeyLocks {
    pub fn new() -> Self {
        Self::with_config(KeyLockConfig::default())
    }

    pub fn with_config(config: KeyLockConfig) -> Self {
        let num_shards = config.num_shards();
        Self {
            shards: (0..num_shards).map(|_| LockShard::new()).collect(),
            shard_mask: num_shards - 1,
            stats: LockStats::default(),
        }
    }

    #[inline]
    fn shard_index(&self, key: &CompositeKey) -> usize {
        let mut hasher = rustc_hash::FxHasher::default();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & self.shard_mask
    }

    /// Whether `key` is currently held.
    pub fn is_locked(&self, key: &CompositeKey) -> bool {
        self.shards[self.shard_index(key)].held.lock().contains(key)
    }

    /// Number of keys currently held across all shards.
    pub fn held_count(&self) -> usize {
        self.shards.iter().map(|s| s.held.lock().len()).sum()
    }

    pub fn stats(&self) -> LockStatsSnapshot {
        LockStatsSnapshot {
            acquired: self.stats.acquired.load(Ordering::Relaxed),
            contended: self.stats.contended.load(Ordering::Relaxed),
            timed_out: self.stats.timed_out.load(Ordering::Relaxed),
        }
    }
}

impl Default for ShardedKeyLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyLocker for ShardedKeyLocks {
    fn try_lock_for(&self, key: &CompositeKey, wait: Duration) -> bool {
        let shard = &self.shards[self.shard_index(key)];
        let deadline = Instant::now() + wait;
        let mut held = shard.held.lock();
        let mut contended = false;
        loop {
            if !held.contains(key) {
                held.insert(key.clone());
                self.stats.acquired.fetch_add(1, Ordering::Relaxed);
                if contended {
                    self.stats.contended.fetch_add(1, Ordering::Relaxed);
                }
                return true;
            }
            contended = true;
            if shard.released.wait_until(&mut held, deadline).timed_out() && held.contains(key) {
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
    }

    fn unlock(&self, key: &CompositeKey) {
        let shard = &self.shards[self.shard_index(key)];
        let removed = shard.held.lock().remove(key);
        if removed {
            shard.released.notify_all();
        }
    }
}
