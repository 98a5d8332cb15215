//! # Uniqueness Validation
//!
//! Detects duplicate composite keys within one bulk pass, before any
//! identifier is minted. Keys are held in memory up to a threshold; past it the
//! seen-set moves into a RocksDB instance in a private temporary directory so
//! memory stays bounded regardless of batch size.
//!
//! A validator is single-writer. [`ShardedUniqueness`] splits the key space by
//! hash across several validators and scans them in parallel.

use hashbrown::HashSet;
use rayon::prelude::*;
use rocksdb::{Options, WriteBatch, DB};
use std::hash::{Hash, Hasher};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum UniquenessError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("uniqueness validator is closed")]
    Closed,
    #[error("spill store error: {0}")]
    Spill(#[from] rocksdb::Error),
    #[error("spill directory error: {0}")]
    Io(#[from] std::io::Error),
}

/// Counters for one validator (or the sum over shards).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UniquenessStats {
    pub checked: u64,
    pub duplicates: u64,
    pub spilled: bool,
}

enum SeenKeys {
    Memory(HashSet<String>),
    // Field order matters: the DB must close before its directory is removed.
    Spilled { db: DB, _dir: TempDir },
}

/// Single-pass duplicate detector with bounded memory.
pub struct UniquenessValidator {
    seen: Option<SeenKeys>,
    spill_threshold: usize,
    stats: UniquenessStats,
}

impl UniquenessValidator {
    pub fn new() -> Self {
        Self::with_spill_threshold(crate::config::DEFAULT_SPILL_THRESHOLD)
    }

    pub fn with_spill_threshold(spill_threshold: usize) -> Self {
        Self {
            seen: Some(SeenKeys::Memory(HashSet::new())),
            spill_threshold,
            stats: UniquenessStats::default(),
        }
    }

    /// `true` the first time `key` is seen, `false` on every later call.
    pub fn is_unique(&mut self, key: &str) -> Result<bool, UniquenessError> {
        if key.is_empty() {
            return Err(UniquenessError::InvalidArgument(
                "ID is required".to_string(),
            ));
        }
        let seen = self.seen.as_mut().ok_or(UniquenessError::Closed)?;
        let unique = match seen {
            SeenKeys::Memory(keys) => {
                if keys.contains(key) {
                    false
                } else {
                    keys.insert(key.to_string());
                    true
                }
            }
            SeenKeys::Spilled { db, .. } => {
                if db.get_pinned(key.as_bytes())?.is_some() {
                    false
                } else {
                    db.put(key.as_bytes(), b"")?;
                    true
                }
            }
        };

        self.stats.checked += 1;
        if !unique {
            self.stats.duplicates += 1;
        }
        if unique && self.should_spill() {
            self.spill()?;
        }
        Ok(unique)
    }

    fn should_spill(&self) -> bool {
        matches!(&self.seen, Some(SeenKeys::Memory(keys)) if keys.len() > self.spill_threshold)
    }

    fn spill(&mut self) -> Result<(), UniquenessError> {
        let Some(SeenKeys::Memory(keys)) = self.seen.take() else {
            return Ok(());
        };
        let dir = tempfile::Builder::new().prefix("occid-uniqueness").tempdir()?;
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DB::open(&options, dir.path())?;

        let mut batch = WriteBatch::default();
        for key in &keys {
            batch.put(key.as_bytes(), b"");
        }
        db.write(batch)?;
        info!(
            keys = keys.len(),
            dir = %dir.path().display(),
            "uniqueness validator spilled to disk"
        );
        self.seen = Some(SeenKeys::Spilled { db, _dir: dir });
        self.stats.spilled = true;
        Ok(())
    }

    /// Release the backing store. Idempotent.
    pub fn close(&mut self) {
        if self.seen.take().is_some() {
            debug!(
                checked = self.stats.checked,
                duplicates = self.stats.duplicates,
                "uniqueness validator closed"
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.seen.is_none()
    }

    pub fn stats(&self) -> UniquenessStats {
        self.stats
    }
}

impl Default for UniquenessValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UniquenessValidator {
    fn drop(&mut self) {
        self.close();
    }
}

/// Hash-partitioned set of validators scanned in parallel.
pub struct ShardedUniqueness {
    shards: Vec<UniquenessValidator>,
}

impl ShardedUniqueness {
    pub fn new(num_shards: usize, spill_threshold: usize) -> Self {
        let per_shard = (spill_threshold / num_shards.max(1)).max(1);
        Self {
            shards: (0..num_shards.max(1))
                .map(|_| UniquenessValidator::with_spill_threshold(per_shard))
                .collect(),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, key: &str) -> usize {
        let mut hasher = rustc_hash::FxHasher::default();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    pub fn is_unique(&mut self, key: &str) -> Result<bool, UniquenessError> {
        let shard = self.shard_for(key);
        self.shards[shard].is_unique(key)
    }

    /// Check every key, in input order per shard; returns one flag per key.
    ///
    /// A key lands on the same shard every time, so the first occurrence in
    /// `keys` is the one reported unique.
    pub fn scan(&mut self, keys: &[&str]) -> Result<Vec<bool>, UniquenessError> {
        let mut partitions: Vec<Vec<(usize, &str)>> = vec![Vec::new(); self.shards.len()];
        for (idx, key) in keys.iter().enumerate() {
            partitions[self.shard_for(key)].push((idx, *key));
        }

        let results = self
            .shards
            .par_iter_mut()
            .zip(partitions.into_par_iter())
            .map(|(validator, part)| {
                part.into_iter()
                    .map(|(idx, key)| validator.is_unique(key).map(|u| (idx, u)))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut flags = vec![true; keys.len()];
        for (idx, unique) in results.into_iter().flatten() {
            flags[idx] = unique;
        }
        Ok(flags)
    }

    pub fn stats(&self) -> UniquenessStats {
        self.shards
            .iter()
            .map(UniquenessValidator::stats)
            .fold(UniquenessStats::default(), |acc, s| UniquenessStats {
                checked: acc.checked + s.checked,
                duplicates: acc.duplicates + s.duplicates,
                spilled: acc.spilled || s.spilled,
            })
    }

    pub fn close(&mut self) {
        self.shards.iter_mut().for_each(UniquenessValidator::close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_duplicates(validator: &mut UniquenessValidator, keys: &[&str]) -> usize {
        keys.iter()
            .filter(|k| !validator.is_unique(k).unwrap())
            .count()
    }

    #[test]
    fn test_unique_ids_have_no_duplicates() {
        let mut validator = UniquenessValidator::new();
        for _ in 0..1000 {
            assert!(validator.is_unique(&uuid::Uuid::new_v4().to_string()).unwrap());
        }
        assert_eq!(validator.stats().duplicates, 0);
    }

    #[test]
    fn test_duplicates_found() {
        let mut validator = UniquenessValidator::new();
        assert_eq!(
            count_duplicates(&mut validator, &["12.1", "1234.1", "111.1", "12.12"]),
            0
        );
        for _ in 0..10 {
            assert!(validator.is_unique(&uuid::Uuid::new_v4().to_string()).unwrap());
        }
        let more = [
            "12.1", "1234.1", "11.1", "12.1", "1234.1", "11.1", "12.12", "12.1", "1234.1", "11.1",
        ];
        assert_eq!(count_duplicates(&mut validator, &more), 9);
    }

    #[test]
    fn test_empty_id_rejected() {
        let mut validator = UniquenessValidator::new();
        let err = validator.is_unique("").unwrap_err();
        assert_eq!(err.to_string(), "ID is required");
        assert!(matches!(err, UniquenessError::InvalidArgument(_)));
    }

    #[test]
    fn test_closed_validator_rejects_calls() {
        let mut validator = UniquenessValidator::new();
        assert!(validator.is_unique("a").unwrap());
        validator.close();
        validator.close();
        assert!(validator.is_closed());
        assert!(matches!(validator.is_unique("a"), Err(UniquenessError::Closed)));
    }

    #[test]
    fn test_spill_keeps_seen_keys() {
        let mut validator = UniquenessValidator::with_spill_threshold(4);
        for i in 0..4 {
            assert!(validator.is_unique(&format!("k{i}")).unwrap());
        }
        assert!(!validator.stats().spilled);
        assert!(validator.is_unique("k4").unwrap());
        assert!(validator.stats().spilled);

        assert!(!validator.is_unique("k0").unwrap());
        assert!(!validator.is_unique("k4").unwrap());
        assert!(validator.is_unique("k5").unwrap());
        assert!(!validator.is_unique("k5").unwrap());

        let stats = validator.stats();
        assert_eq!(stats.checked, 9);
        assert_eq!(stats.duplicates, 3);
    }

    #[test]
    fn test_sharded_scan_matches_sequential() {
        let keys = [
            "12.1", "1234.1", "11.1", "12.1", "1234.1", "11.1", "12.12", "12.1", "1234.1", "11.1",
        ];
        let mut sharded = ShardedUniqueness::new(4, 2);
        let flags = sharded.scan(&keys).unwrap();

        let mut sequential = UniquenessValidator::new();
        let expected: Vec<bool> = keys
            .iter()
            .map(|k| sequential.is_unique(k).unwrap())
            .collect();
        assert_eq!(flags, expected);
        assert_eq!(sharded.stats().duplicates, 6);
        assert!(!sharded.is_unique("11.1").unwrap());

        sharded.close();
        assert!(matches!(sharded.is_unique("new"), Err(UniquenessError::Closed)));
    }
}
