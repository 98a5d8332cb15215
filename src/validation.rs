//! Bulk pre-mint validation: derives every record's key, counts records
//! without a usable key and finds duplicated keys, producing the
//! [`ValidationReport`] the gate consumes.
//!
//! Records are consumed as a stream. Keys are buffered only up to the
//! configured chunk size before going to the sharded validators, so memory is
//! bounded by the chunk, the validators' spill thresholds and the list of
//! distinct duplicated keys.

use std::borrow::Borrow;

use crate::config::UniquenessConfig;
use crate::gate::ValidationReport;
use crate::keys::KeyBuilder;
use crate::model::{CompositeKey, OccurrenceRecord};
use crate::uniqueness::{ShardedUniqueness, UniquenessError, UniquenessStats, UniquenessValidator};
use tracing::{debug, info, instrument, warn};

/// Result of a validation scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchValidation {
    pub report: ValidationReport,
    /// Each duplicated key once, in first-duplicate order
    pub duplicate_keys: Vec<CompositeKey>,
    pub records_scanned: usize,
    /// Counters of the sharded seen-set, including whether it spilled to disk
    pub uniqueness: UniquenessStats,
}

/// Running duplicate tally across chunks.
struct DuplicateTally {
    seen: ShardedUniqueness,
    distinct: UniquenessValidator,
    duplicate_keys: Vec<CompositeKey>,
    encounters: i64,
}

impl DuplicateTally {
    fn new(config: &UniquenessConfig) -> Self {
        Self {
            seen: ShardedUniqueness::new(config.shards, config.spill_threshold),
            distinct: UniquenessValidator::with_spill_threshold(config.spill_threshold),
            duplicate_keys: Vec::new(),
            encounters: 0,
        }
    }

    /// Check one chunk; chunks must arrive in input order.
    fn absorb(&mut self, chunk: &[CompositeKey]) -> Result<(), UniquenessError> {
        let raw: Vec<&str> = chunk.iter().map(CompositeKey::as_str).collect();
        let flags = self.seen.scan(&raw)?;
        for (key, unique) in chunk.iter().zip(flags) {
            if unique {
                continue;
            }
            self.encounters += 1;
            if self.distinct.is_unique(key.as_str())? {
                self.duplicate_keys.push(key.clone());
            }
        }
        debug!(keys = chunk.len(), encounters = self.encounters, "validation chunk checked");
        Ok(())
    }
}

/// Scan `records` for empty and duplicated keys.
///
/// `duplicateKeyCount` counts repeat encounters; `duplicateRecordKeyCount`
/// counts every record whose key is shared, first encounters included.
#[instrument(skip_all, fields(dataset_id = builder.dataset_id()))]
pub fn validate_records<I, R>(
    builder: &KeyBuilder,
    records: I,
    metadata_available: bool,
    config: &UniquenessConfig,
) -> Result<BatchValidation, UniquenessError>
where
    I: IntoIterator<Item = R>,
    R: Borrow<OccurrenceRecord>,
{
    let mut report = ValidationReport {
        metadata_available,
        unique_terms_specified: builder.has_terms(),
        ..Default::default()
    };
    if !builder.has_terms() {
        warn!("no unique terms configured, skipping key scan");
        return Ok(BatchValidation {
            report,
            duplicate_keys: Vec::new(),
            records_scanned: 0,
            uniqueness: UniquenessStats::default(),
        });
    }

    let chunk_size = config.chunk_size.max(1);
    let mut tally = DuplicateTally::new(config);
    let mut chunk: Vec<CompositeKey> = Vec::with_capacity(chunk_size);
    let mut records_scanned = 0usize;
    let mut empty_key_records: i64 = 0;

    for record in records {
        records_scanned += 1;
        match builder.build_key_for_validation(record.borrow()) {
            Some(key) => chunk.push(key),
            None => empty_key_records += 1,
        }
        if chunk.len() >= chunk_size {
            tally.absorb(&chunk)?;
            chunk.clear();
        }
    }
    if !chunk.is_empty() {
        tally.absorb(&chunk)?;
    }

    let uniqueness = tally.seen.stats();
    tally.seen.close();
    tally.distinct.close();
    let DuplicateTally {
        duplicate_keys,
        encounters,
        ..
    } = tally;

    report.empty_key_records = empty_key_records;
    report.duplicate_key_count = encounters;
    report.duplicate_record_key_count = if encounters == 0 {
        0
    } else {
        encounters + duplicate_keys.len() as i64
    };

    if empty_key_records > 0 {
        warn!(empty_key_records, "records with empty values for all unique terms");
    }
    if encounters > 0 {
        warn!(
            duplicate_key_count = encounters,
            distinct_keys = duplicate_keys.len(),
            "duplicate keys found"
        );
    }
    info!(
        records_scanned,
        empty_key_records,
        duplicate_key_count = report.duplicate_key_count,
        spilled = uniqueness.spilled,
        "validation scan finished"
    );

    Ok(BatchValidation {
        report,
        duplicate_keys,
        records_scanned,
        uniqueness,
    })
}

impl BatchValidation {
    /// Whether the scan found anything blocking. Unknown counters block.
    pub fn is_clean(&self) -> bool {
        self.report.empty_key_records == 0 && self.report.duplicate_key_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::UNKNOWN_COUNT;
    use crate::model::Term;

    fn builder() -> KeyBuilder {
        KeyBuilder::new("dr1", vec![Term::new("catalogNumber")])
    }

    fn record(id: &str, catalog: &str) -> OccurrenceRecord {
        OccurrenceRecord::new(id).with_term("catalogNumber", catalog)
    }

    fn config() -> UniquenessConfig {
        UniquenessConfig {
            spill_threshold: 1_000,
            shards: 3,
            chunk_size: 1_000,
        }
    }

    fn mixed_batch() -> Vec<OccurrenceRecord> {
        vec![
            record("1", "A"),
            record("2", "A"),
            record("3", "A"),
            record("4", "B"),
            record("5", "C"),
            record("6", "  "),
            record("7", "B"),
        ]
    }

    #[test]
    fn test_counts_duplicates_and_empty_keys() {
        let result = validate_records(&builder(), &mixed_batch(), true, &config()).unwrap();
        assert_eq!(result.records_scanned, 7);
        assert_eq!(result.report.empty_key_records, 1);
        assert_eq!(result.report.duplicate_key_count, 3);
        assert_eq!(result.report.duplicate_record_key_count, 5);
        assert_eq!(result.duplicate_keys.len(), 2);
        assert_eq!(result.uniqueness.checked, 6);
        assert!(!result.uniqueness.spilled);
        assert!(!result.is_clean());
    }

    #[test]
    fn test_chunk_boundaries_do_not_change_counts() {
        let whole = validate_records(&builder(), &mixed_batch(), true, &config()).unwrap();
        for chunk_size in [1, 2, 3] {
            let chunked = UniquenessConfig {
                chunk_size,
                ..config()
            };
            let result = validate_records(&builder(), &mixed_batch(), true, &chunked).unwrap();
            assert_eq!(result.report, whole.report);
            assert_eq!(result.duplicate_keys, whole.duplicate_keys);
        }
    }

    #[test]
    fn test_streams_owned_records_and_spills() {
        let tight = UniquenessConfig {
            spill_threshold: 4,
            shards: 2,
            chunk_size: 16,
        };
        // Owned records from a lazy iterator; nothing is collected up front.
        let records = (0..200).map(|i| record(&i.to_string(), &format!("C-{}", i % 150)));
        let result = validate_records(&builder(), records, true, &tight).unwrap();
        assert_eq!(result.records_scanned, 200);
        assert_eq!(result.report.duplicate_key_count, 50);
        assert_eq!(result.report.duplicate_record_key_count, 100);
        assert!(result.uniqueness.spilled);
    }

    #[test]
    fn test_clean_batch() {
        let records = vec![record("1", "A"), record("2", "B")];
        let result = validate_records(&builder(), &records, true, &config()).unwrap();
        assert!(result.is_clean());
        assert!(result.report.unique_terms_specified);
        assert_eq!(result.report.duplicate_record_key_count, 0);
    }

    #[test]
    fn test_no_terms_reports_unknown_counts() {
        let builder = KeyBuilder::new("dr1", Vec::new());
        let result = validate_records(&builder, &[record("1", "A")], true, &config()).unwrap();
        assert!(!result.report.unique_terms_specified);
        assert_eq!(result.report.duplicate_key_count, UNKNOWN_COUNT);
        assert!(!result.is_clean());
    }
}
