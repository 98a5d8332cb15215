//! Validation scan through to the gate verdict.

use occurrence_identity::config::UniquenessConfig;
use occurrence_identity::gate::ReasonCode;
use occurrence_identity::test_support::generate_records;
use occurrence_identity::uniqueness::UniquenessValidator;
use occurrence_identity::{
    FsReportSource, IdentityService, IdentityStore, KeyBuilder, MemoryKeyStore, OccurrenceRecord,
    Term, ValidationGate,
};
use tempfile::tempdir;

fn service(terms: &[&str]) -> IdentityService {
    IdentityService::new(
        KeyBuilder::new("dr1", terms.iter().map(Term::new).collect()),
        IdentityStore::new(MemoryKeyStore::new()),
    )
    .with_uniqueness(UniquenessConfig {
        spill_threshold: 8,
        shards: 4,
        chunk_size: 16,
    })
}

fn record(id: &str, catalog: &str) -> OccurrenceRecord {
    OccurrenceRecord::new(id).with_term("catalogNumber", catalog)
}

#[test]
fn shared_key_batch_is_refused() -> anyhow::Result<()> {
    let records = vec![
        record("1", "C-1"),
        record("2", "C-1"),
        record("3", "C-1"),
        record("4", "C-2"),
        record("5", "C-3"),
    ];

    let mut validator = UniquenessValidator::new();
    let encounters = records
        .iter()
        .map(|r| KeyBuilder::new("dr1", vec![Term::new("catalogNumber")]).build_key(r))
        .filter_map(Result::ok)
        .filter(|key| !validator.is_unique(key.as_str()).unwrap())
        .count();
    assert_eq!(encounters, 2);

    let result = service(&["catalogNumber"]).validate_batch(&records, true)?;
    assert_eq!(result.report.duplicate_key_count, 2);
    assert_eq!(result.report.duplicate_record_key_count, 3);
    assert_eq!(result.report.empty_key_records, 0);
    assert_eq!(result.duplicate_keys.len(), 1);
    assert_eq!(result.duplicate_keys[0].as_str(), "dr1|C-1");

    let dir = tempdir()?;
    let reports = FsReportSource::new(dir.path());
    reports.write_report("dr1", 1, &result.report)?;
    let csv = reports.write_duplicate_keys("dr1", 1, &result.duplicate_keys)?;
    assert_eq!(std::fs::read_to_string(csv)?, "key\ndr1|C-1\n");
    let verdict = ValidationGate::new(reports).check("dr1", 1)?;
    assert_eq!(verdict.reason, ReasonCode::HasDuplicates);
    Ok(())
}

#[test]
fn generated_batch_counts_match() -> anyhow::Result<()> {
    let batch = generate_records(500, 0.2, 0.05, 3);
    let result = service(&["catalogNumber"]).validate_batch(&batch.records, true)?;

    assert_eq!(result.records_scanned, 500);
    assert_eq!(result.report.empty_key_records, batch.empty as i64);
    assert_eq!(result.report.duplicate_key_count, batch.duplicates as i64);
    assert!(result.report.duplicate_record_key_count >= result.report.duplicate_key_count);
    // The spill threshold is tiny, so the scan went through RocksDB.
    assert!(result.uniqueness.spilled);
    assert_eq!(result.uniqueness.checked, (500 - batch.empty) as u64);
    Ok(())
}

#[test]
fn duplicates_across_chunks_are_found_in_a_stream() -> anyhow::Result<()> {
    // chunk_size is 16, so every repeat below lands in a later chunk than its first.
    let records = (0..64).map(|i| record(&i.to_string(), &format!("C-{}", i % 40)));
    let result = service(&["catalogNumber"]).validate_batch(records, true)?;
    assert_eq!(result.records_scanned, 64);
    assert_eq!(result.report.duplicate_key_count, 24);
    assert_eq!(result.report.duplicate_record_key_count, 48);
    assert_eq!(result.duplicate_keys.len(), 24);
    assert_eq!(result.duplicate_keys[0].as_str(), "dr1|C-0");
    assert!(result.uniqueness.spilled);
    Ok(())
}

#[test]
fn clean_batch_passes_and_empty_keys_block() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let reports = FsReportSource::new(dir.path());
    let gate = ValidationGate::new(reports.clone());

    let clean = service(&["catalogNumber"])
        .validate_batch(&[record("1", "A"), record("2", "B")], true)?;
    reports.write_report("dr1", 1, &clean.report)?;
    assert!(gate.check("dr1", 1)?.is_ok());

    let with_empty = service(&["catalogNumber"])
        .validate_batch(&[record("1", "A"), record("2", "NULL")], true)?;
    reports.write_report("dr1", 2, &with_empty.report)?;
    assert_eq!(gate.check("dr1", 2)?.reason, ReasonCode::HasEmptyKeys);

    let no_metadata = service(&["catalogNumber"]).validate_batch(&[record("1", "A")], false)?;
    reports.write_report("dr1", 3, &no_metadata.report)?;
    assert_eq!(gate.check("dr1", 3)?.reason, ReasonCode::MetadataNotAvailable);

    let no_terms = service(&[]).validate_batch(&[record("1", "A")], true)?;
    reports.write_report("dr1", 4, &no_terms.report)?;
    assert_eq!(gate.check("dr1", 4)?.reason, ReasonCode::UniqueTermsNotSpecified);
    Ok(())
}
