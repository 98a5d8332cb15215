//! # Occurrence Identity
//!
//! Stable identifiers for occurrence records.
//!
//! This library derives deterministic composite keys from configurable record
//! terms, mints one identifier per key exactly once under concurrent access,
//! detects duplicate keys in a batch before minting, resolves collisions
//! between a record's key forms, and gates indexing on the integrity of all of
//! the above.

pub mod config;
pub mod gate;
pub mod identity;
pub mod keys;
pub mod locks;
pub mod model;
pub mod persistence;
pub mod resolver;
pub mod store;
pub mod test_support;
pub mod uniqueness;
pub mod validation;

pub use config::IdentityConfig;
pub use gate::{FsReportSource, GateVerdict, ReasonCode, ValidationGate, ValidationReport};
pub use identity::{DeleteOutcome, IdentityError, IdentityStore, LockPolicy};
pub use keys::{KeyBuilder, KeyForms, KeyGenerationError};
pub use model::{CompositeKey, Identifier, OccurrenceRecord, Term};
pub use persistence::RocksKeyStore;
pub use resolver::{DeletionPolicy, Remediation, RemediationReport};
pub use store::{KeyStore, MemoryKeyStore};
pub use uniqueness::{ShardedUniqueness, UniquenessError, UniquenessValidator};
pub use validation::BatchValidation;

use config::UniquenessConfig;
use locks::ShardedKeyLocks;
use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Identifier assigned to one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MintAssignment {
    pub record_id: String,
    pub identifier: Identifier,
}

/// Why a record got no identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MintFailureKind {
    EmptyKey,
    LockTimeout,
    /// A write failed while the key lock was held
    Persistence,
    /// Reading the current association failed
    StoreRead,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MintFailure {
    pub record_id: String,
    pub kind: MintFailureKind,
    pub reason: String,
}

/// Outcome of a batch mint. Failures are per record and never abort the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MintSummary {
    pub assignments: Vec<MintAssignment>,
    pub failures: Vec<MintFailure>,
}

impl MintSummary {
    pub fn failure_count(&self, kind: MintFailureKind) -> usize {
        self.failures.iter().filter(|f| f.kind == kind).count()
    }
}

/// Composition root: one dataset's key builder plus the identity store.
pub struct IdentityService {
    keys: KeyBuilder,
    store: IdentityStore,
    uniqueness: UniquenessConfig,
}

impl IdentityService {
    pub fn new(keys: KeyBuilder, store: IdentityStore) -> Self {
        Self {
            keys,
            store,
            uniqueness: UniquenessConfig::default(),
        }
    }

    pub fn with_uniqueness(mut self, uniqueness: UniquenessConfig) -> Self {
        self.uniqueness = uniqueness;
        self
    }

    /// Open the RocksDB-backed store described by `config` for `dataset_id`.
    pub fn open(dataset_id: &str, config: &IdentityConfig) -> anyhow::Result<Self> {
        let backend =
            RocksKeyStore::open_with_options(&config.store.data_dir, config.store.open_options())?;
        let store = IdentityStore::with_parts(
            Arc::new(backend),
            Arc::new(ShardedKeyLocks::with_config(
                config.locks.to_lock_table_config(),
            )),
            config.locks.to_lock_policy(),
        );
        let keys = KeyBuilder::new(dataset_id, config.keys.terms());
        Ok(Self::new(keys, store).with_uniqueness(config.uniqueness.clone()))
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    pub fn store(&self) -> &IdentityStore {
        &self.store
    }

    /// Scan a batch for empty and duplicated keys.
    pub fn validate_batch<I, R>(
        &self,
        records: I,
        metadata_available: bool,
    ) -> Result<BatchValidation, UniquenessError>
    where
        I: IntoIterator<Item = R>,
        R: std::borrow::Borrow<OccurrenceRecord>,
    {
        validation::validate_records(&self.keys, records, metadata_available, &self.uniqueness)
    }

    /// Assign identifiers to every record, in parallel.
    #[instrument(skip_all, fields(dataset_id = self.keys.dataset_id(), records = records.len()))]
    pub fn mint_batch(&self, records: &[OccurrenceRecord]) -> MintSummary {
        let results: Vec<Result<MintAssignment, MintFailure>> = records
            .par_iter()
            .map(|record| self.mint_record(record))
            .collect();

        let mut summary = MintSummary::default();
        for result in results {
            match result {
                Ok(assignment) => summary.assignments.push(assignment),
                Err(failure) => summary.failures.push(failure),
            }
        }
        if !summary.failures.is_empty() {
            warn!(
                failed = summary.failures.len(),
                empty_keys = summary.failure_count(MintFailureKind::EmptyKey),
                lock_timeouts = summary.failure_count(MintFailureKind::LockTimeout),
                "records left without identifier"
            );
        }
        info!(assigned = summary.assignments.len(), "mint batch finished");
        summary
    }

    fn mint_record(&self, record: &OccurrenceRecord) -> Result<MintAssignment, MintFailure> {
        let failure = |kind, reason: String| MintFailure {
            record_id: record.id.clone(),
            kind,
            reason,
        };
        let key = self
            .keys
            .build_key(record)
            .map_err(|err| failure(MintFailureKind::EmptyKey, err.to_string()))?;
        let identifier = self.store.get_or_mint(&key).map_err(|err| {
            let kind = match err {
                IdentityError::LockTimeout { .. } => MintFailureKind::LockTimeout,
                IdentityError::Persistence { .. } => MintFailureKind::Persistence,
                IdentityError::Store(_) => MintFailureKind::StoreRead,
            };
            failure(kind, err.to_string())
        })?;
        Ok(MintAssignment {
            record_id: record.id.clone(),
            identifier,
        })
    }

    /// Operator-triggered collision remediation over the records' key forms.
    pub fn remediate(
        &self,
        records: &[OccurrenceRecord],
        policy: DeletionPolicy,
        only_collisions: bool,
        dry_run: bool,
    ) -> RemediationReport {
        let pairs: Vec<KeyForms> = records
            .iter()
            .map(|record| KeyForms::for_record(self.keys.dataset_id(), record))
            .filter(|forms| forms.is_complete())
            .collect();
        Remediation::new(&self.store, policy)
            .only_collisions(only_collisions)
            .dry_run(dry_run)
            .run(&pairs)
    }
}
