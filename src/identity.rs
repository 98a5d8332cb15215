//! # Identity Module
//!
//! Exactly-once identifier minting on top of a [`KeyStore`].
//!
//! Per key the protocol moves `UNKNOWN → LOCKED → RESOLVED`:
//!
//! 1. Fast path: read the association without locking.
//! 2. Slow path: take the per-key lock (bounded wait, exponential backoff,
//!    fixed attempt budget), read again under the lock, and only then mint and
//!    write the forward and reverse entries in one conditional put.
//!
//! The lock is released on every exit path by [`HeldKey`]'s `Drop`.

use crate::locks::{KeyLocker, ShardedKeyLocks};
use crate::model::{CompositeKey, Identifier};
use crate::store::{KeyStore, PutOutcome, StoreError};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Lock acquisition policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockPolicy {
    /// Bounded wait for a single acquisition attempt
    pub wait: Duration,
    /// Attempts before the record is given up on
    pub max_attempts: u32,
    /// Sleep after the first failed attempt; doubles each retry
    pub initial_backoff: Duration,
    /// Upper bound for the backoff sleep
    pub max_backoff: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(crate::config::DEFAULT_LOCK_WAIT_MS),
            max_attempts: crate::config::DEFAULT_LOCK_ATTEMPTS,
            initial_backoff: Duration::from_millis(crate::config::DEFAULT_LOCK_BACKOFF_MS),
            max_backoff: Duration::from_millis(crate::config::DEFAULT_LOCK_MAX_BACKOFF_MS),
        }
    }
}

impl LockPolicy {
    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Failure of an identity operation for a single key.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The per-key lock could not be taken within the attempt budget.
    #[error("lock for key {key} not acquired after {attempts} attempts")]
    LockTimeout { key: CompositeKey, attempts: u32 },
    /// A write failed while the lock was held. State must be re-read before retrying.
    #[error("failed to persist association for key {key}: {source}")]
    Persistence {
        key: CompositeKey,
        #[source]
        source: StoreError,
    },
    /// A read against the backing store failed.
    #[error("store read failed: {0}")]
    Store(#[from] StoreError),
}

impl IdentityError {
    /// Whether the caller may retry the same operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IdentityError::LockTimeout { .. })
    }
}

/// Outcome of a conditional delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The association was removed.
    Deleted(Identifier),
    /// Nothing was associated with the key.
    Absent,
    /// The key now maps to a different identifier than expected; left untouched.
    Changed(Identifier),
}

/// Counters describing store activity.
#[derive(Debug, Default)]
pub struct MintMetrics {
    pub fast_path_hits: AtomicU64,
    pub resolved_under_lock: AtomicU64,
    pub minted: AtomicU64,
    pub lock_retries: AtomicU64,
    pub lock_timeouts: AtomicU64,
    pub deleted: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MintMetricsSnapshot {
    pub fast_path_hits: u64,
    pub resolved_under_lock: u64,
    pub minted: u64,
    pub lock_retries: u64,
    pub lock_timeouts: u64,
    pub deleted: u64,
}

/// A held per-key lock, released on drop.
struct HeldKey<'a> {
    locker: &'a dyn KeyLocker,
    key: &'a CompositeKey,
}

impl Drop for HeldKey<'_> {
    fn drop(&mut self) {
        self.locker.unlock(self.key);
    }
}

/// Durable, lock-protected key → identifier mapping.
pub struct IdentityStore {
    backend: Arc<dyn KeyStore>,
    locker: Arc<dyn KeyLocker>,
    policy: LockPolicy,
    metrics: MintMetrics,
}

impl IdentityStore {
    /// Create an identity store with an in-process lock table.
    pub fn new<S>(backend: S) -> Self
    where
        S: KeyStore + 'static,
    {
        Self::with_parts(
            Arc::new(backend),
            Arc::new(ShardedKeyLocks::new()),
            LockPolicy::default(),
        )
    }

    pub fn with_policy<S>(backend: S, policy: LockPolicy) -> Self
    where
        S: KeyStore + 'static,
    {
        Self::with_parts(Arc::new(backend), Arc::new(ShardedKeyLocks::new()), policy)
    }

    /// Create an identity store from shared parts, e.g. a lock table used by
    /// several stores over the same backend.
    pub fn with_parts(
        backend: Arc<dyn KeyStore>,
        locker: Arc<dyn KeyLocker>,
        policy: LockPolicy,
    ) -> Self {
        Self {
            backend,
            locker,
            policy,
            metrics: MintMetrics::default(),
        }
    }

    pub fn backend(&self) -> &dyn KeyStore {
        self.backend.as_ref()
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    /// Read the identifier for `key` without locking.
    pub fn lookup(&self, key: &CompositeKey) -> Result<Option<Identifier>, IdentityError> {
        Ok(self.backend.get(key)?)
    }

    /// Return the identifier for `key`, minting and persisting one if needed.
    pub fn get_or_mint(&self, key: &CompositeKey) -> Result<Identifier, IdentityError> {
        if let Some(id) = self.backend.get(key)? {
            self.metrics.fast_path_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(id);
        }

        let _held = self.acquire(key)?;

        // Another writer may have resolved the key while we waited.
        if let Some(id) = self.backend.get(key)? {
            self.metrics
                .resolved_under_lock
                .fetch_add(1, Ordering::Relaxed);
            return Ok(id);
        }

        let id = Identifier::mint();
        match self.backend.put_if_absent(key, id) {
            Ok(PutOutcome::Inserted) => {
                self.metrics.minted.fetch_add(1, Ordering::Relaxed);
                debug!(%key, %id, "minted identifier");
                Ok(id)
            }
            Ok(PutOutcome::Existing(existing)) => {
                // A writer outside this lock table won the conditional put.
                self.metrics
                    .resolved_under_lock
                    .fetch_add(1, Ordering::Relaxed);
                Ok(existing)
            }
            Err(source) => {
                warn!(%key, error = %source, "persisting association failed");
                Err(IdentityError::Persistence {
                    key: key.clone(),
                    source,
                })
            }
        }
    }

    /// All keys currently associated with `id`.
    pub fn reverse_lookup(&self, id: &Identifier) -> Result<BTreeSet<CompositeKey>, IdentityError> {
        Ok(self.backend.keys_for(id)?)
    }

    /// Remove whatever association `key` currently has.
    pub fn delete(&self, key: &CompositeKey) -> Result<Option<Identifier>, IdentityError> {
        let _held = self.acquire(key)?;
        match self.backend.get(key)? {
            Some(current) => match self.remove_locked(key, current)? {
                DeleteOutcome::Deleted(id) => Ok(Some(id)),
                DeleteOutcome::Absent | DeleteOutcome::Changed(_) => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Remove the association of `key` only if it still maps to `expected`.
    pub fn delete_expected(
        &self,
        key: &CompositeKey,
        expected: Identifier,
    ) -> Result<DeleteOutcome, IdentityError> {
        let _held = self.acquire(key)?;
        match self.backend.get(key)? {
            None => Ok(DeleteOutcome::Absent),
            Some(current) if current != expected => {
                debug!(%key, %expected, %current, "association changed since snapshot");
                Ok(DeleteOutcome::Changed(current))
            }
            Some(current) => self.remove_locked(key, current),
        }
    }

    fn remove_locked(
        &self,
        key: &CompositeKey,
        current: Identifier,
    ) -> Result<DeleteOutcome, IdentityError> {
        let removed = self
            .backend
            .delete_if(key, current)
            .map_err(|source| IdentityError::Persistence {
                key: key.clone(),
                source,
            })?;
        if removed {
            self.metrics.deleted.fetch_add(1, Ordering::Relaxed);
            debug!(%key, id = %current, "deleted association");
            return Ok(DeleteOutcome::Deleted(current));
        }

        // A writer outside this lock table moved the row since the read.
        match self.backend.get(key)? {
            Some(now) => {
                debug!(%key, expected = %current, current = %now, "association changed before delete");
                Ok(DeleteOutcome::Changed(now))
            }
            None => Ok(DeleteOutcome::Absent),
        }
    }

    fn acquire<'a>(&'a self, key: &'a CompositeKey) -> Result<HeldKey<'a>, IdentityError> {
        let attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            if self.locker.try_lock_for(key, self.policy.wait) {
                return Ok(HeldKey {
                    locker: self.locker.as_ref(),
                    key,
                });
            }
            if attempt < attempts {
                self.metrics.lock_retries.fetch_add(1, Ordering::Relaxed);
                let backoff = self.policy.backoff_for(attempt);
                debug!(%key, attempt, ?backoff, "key lock busy, backing off");
                std::thread::sleep(backoff);
            }
        }
        self.metrics.lock_timeouts.fetch_add(1, Ordering::Relaxed);
        warn!(%key, attempts, "key lock not acquired");
        Err(IdentityError::LockTimeout {
            key: key.clone(),
            attempts,
        })
    }

    pub fn metrics(&self) -> MintMetricsSnapshot {
        MintMetricsSnapshot {
            fast_path_hits: self.metrics.fast_path_hits.load(Ordering::Relaxed),
            resolved_under_lock: self.metrics.resolved_under_lock.load(Ordering::Relaxed),
            minted: self.metrics.minted.load(Ordering::Relaxed),
            lock_retries: self.metrics.lock_retries.load(Ordering::Relaxed),
            lock_timeouts: self.metrics.lock_timeouts.load(Ordering::Relaxed),
            deleted: self.metrics.deleted.load(Ordering::Relaxed),
        }
    }
}
