//! Indexing precheck over on-disk reports and stage artifacts.

use std::fs::File;
use std::path::Path;
use std::time::{Duration, SystemTime};

use occurrence_identity::gate::{GateError, ReasonCode, Stage};
use occurrence_identity::{FsReportSource, ValidationGate, ValidationReport};
use tempfile::tempdir;

fn clean_report() -> ValidationReport {
    ValidationReport {
        metadata_available: true,
        unique_terms_specified: true,
        empty_key_records: 0,
        duplicate_key_count: 0,
        duplicate_record_key_count: 0,
        ..Default::default()
    }
}

fn stage_at(source: &FsReportSource, dataset: &str, stage: Stage, secs: u64) {
    let path = source
        .write_stage_artifact(dataset, 1, stage, &serde_json::json!({ "stage": stage.to_string() }))
        .unwrap();
    set_mtime(&path, secs);
}

fn set_mtime(path: &Path, secs: u64) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

#[test]
fn ordered_stages_are_ready() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let source = FsReportSource::new(dir.path());
    source.write_report("dr7", 1, &clean_report())?;
    stage_at(&source, "dr7", Stage::Verbatim, 1_000);
    stage_at(&source, "dr7", Stage::Interpretation, 2_000);
    stage_at(&source, "dr7", Stage::IdentifierMint, 3_000);

    let verdict = ValidationGate::new(source).check_ready_for_indexing("dr7", 1)?;
    assert_eq!(verdict.reason, ReasonCode::Ok);
    assert!(verdict.warnings.is_empty());
    Ok(())
}

#[test]
fn reinterpretation_requires_new_mint() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let source = FsReportSource::new(dir.path());
    source.write_report("dr7", 1, &clean_report())?;
    stage_at(&source, "dr7", Stage::Verbatim, 1_000);
    stage_at(&source, "dr7", Stage::IdentifierMint, 2_000);
    stage_at(&source, "dr7", Stage::Interpretation, 3_000);

    let gate = ValidationGate::new(source);
    assert_eq!(
        gate.check_ready_for_indexing("dr7", 1)?.reason,
        ReasonCode::UuidRequired
    );
    assert_eq!(gate.check("dr7", 1)?.reason, ReasonCode::Ok);
    Ok(())
}

#[test]
fn report_rules_win_over_timestamps() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let source = FsReportSource::new(dir.path());
    source.write_report(
        "dr7",
        1,
        &ValidationReport {
            duplicate_key_count: 4,
            duplicate_record_key_count: 6,
            ..clean_report()
        },
    )?;
    // No stage artifacts at all: the report rule decides first.
    let verdict = ValidationGate::new(source).check_ready_for_indexing("dr7", 1)?;
    assert_eq!(verdict.reason, ReasonCode::HasDuplicates);
    Ok(())
}

#[test]
fn missing_interpretation_is_an_error() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let source = FsReportSource::new(dir.path());
    source.write_report("dr7", 1, &clean_report())?;
    stage_at(&source, "dr7", Stage::Verbatim, 1_000);

    let err = ValidationGate::new(source)
        .check_ready_for_indexing("dr7", 1)
        .unwrap_err();
    assert!(matches!(
        err,
        GateError::MissingArtifact {
            stage: Stage::Interpretation,
            ..
        }
    ));
    Ok(())
}

#[test]
fn attempts_are_isolated() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let source = FsReportSource::new(dir.path());
    source.write_report("dr7", 1, &clean_report())?;

    let gate = ValidationGate::new(source);
    assert!(gate.check("dr7", 1)?.is_ok());
    assert_eq!(gate.check("dr7", 2)?.reason, ReasonCode::NotValidated);
    assert_eq!(gate.check("dr8", 1)?.reason, ReasonCode::NotValidated);
    Ok(())
}
