//! # Store Module
//!
//! Durable medium abstraction for key → identifier associations, and the
//! in-memory implementation used by tests and single-process runs.
//!
//! A [`KeyStore`] keeps the forward map and the reverse identifier → keys
//! index in step: every write updates both or neither.

use crate::model::{CompositeKey, Identifier};
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use thiserror::Error;

/// Backend failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rocksdb error: {0}")]
    Rocks(#[from] rocksdb::Error),
    #[error("corrupt entry for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("storage format error: {0}")]
    Format(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result of a conditional insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The association was written.
    Inserted,
    /// The key was already associated; carries the stored identifier. Nothing was written.
    Existing(Identifier),
}

/// Row-granular durable medium for key associations.
pub trait KeyStore: Send + Sync {
    /// Read the identifier currently associated with `key`.
    fn get(&self, key: &CompositeKey) -> Result<Option<Identifier>, StoreError>;

    /// Write `key → id` and the reverse entry atomically, unless `key` is
    /// already associated.
    fn put_if_absent(&self, key: &CompositeKey, id: Identifier) -> Result<PutOutcome, StoreError>;

    /// Remove `key` and its reverse entry if it still maps to `expected`.
    ///
    /// Returns whether anything was removed.
    fn delete_if(&self, key: &CompositeKey, expected: Identifier) -> Result<bool, StoreError>;

    /// All keys currently associated with `id`, from the reverse index.
    fn keys_for(&self, id: &Identifier) -> Result<BTreeSet<CompositeKey>, StoreError>;

    /// Number of forward associations.
    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

#[derive(Debug, Default)]
struct Associations {
    forward: HashMap<CompositeKey, Identifier>,
    reverse: HashMap<Identifier, BTreeSet<CompositeKey>>,
}

/// In-memory key store.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    inner: RwLock<Associations>,
}

impl MemoryKeyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, key: &CompositeKey) -> Result<Option<Identifier>, StoreError> {
        Ok(self.inner.read().forward.get(key).copied())
    }

    fn put_if_absent(&self, key: &CompositeKey, id: Identifier) -> Result<PutOutcome, StoreError> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.forward.get(key) {
            return Ok(PutOutcome::Existing(*existing));
        }
        inner.forward.insert(key.clone(), id);
        inner.reverse.entry(id).or_default().insert(key.clone());
        Ok(PutOutcome::Inserted)
    }

    fn delete_if(&self, key: &CompositeKey, expected: Identifier) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        if inner.forward.get(key) != Some(&expected) {
            return Ok(false);
        }
        inner.forward.remove(key);
        if let Some(keys) = inner.reverse.get_mut(&expected) {
            keys.remove(key);
            if keys.is_empty() {
                inner.reverse.remove(&expected);
            }
        }
        Ok(true)
    }

    fn keys_for(&self, id: &Identifier) -> Result<BTreeSet<CompositeKey>, StoreError> {
        Ok(self.inner.read().reverse.get(id).cloned().unwrap_or_default())
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.inner.read().forward.len())
    }
}
