//! # Validation Gate
//!
//! Decides whether a dataset attempt may proceed to indexing from its
//! persisted [`ValidationReport`] and the modification times of its stage
//! artifacts. Rules run in order and the first failure is the verdict:
//!
//! 1. no report: `NOT_VALIDATED`
//! 2. metadata unavailable: `METADATA_NOT_AVAILABLE`
//! 3. no identity terms: `UNIQUE_TERMS_NOT_SPECIFIED`
//! 4. `emptyKeyRecords != 0`: `HAS_EMPTY_KEYS`
//! 5. `duplicateKeyCount != 0`: `HAS_DUPLICATES`
//! 6. (indexing only) interpretation newer than minting: `UUID_REQUIRED`
//!
//! The gate only reads.

use crate::model::CompositeKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const VALIDATION_REPORT_FILE: &str = "validation-report.json";
/// Attempt subdirectory holding validation outputs other than the report.
pub const VALIDATION_OUTPUT_DIR: &str = "validation";
pub const DUPLICATE_KEYS_OUTPUT: &str = "duplicateKeys.csv";

/// Counter value used when a report does not carry the field.
pub const UNKNOWN_COUNT: i64 = -1;

fn unknown_count() -> i64 {
    UNKNOWN_COUNT
}

/// Pipeline stages whose artifacts carry the stage timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Verbatim,
    Interpretation,
    IdentifierMint,
}

impl Stage {
    pub fn artifact_name(&self) -> &'static str {
        match self {
            Stage::Verbatim => "verbatim-metrics.json",
            Stage::Interpretation => "interpretation-metrics.json",
            Stage::IdentifierMint => "identifier-metrics.json",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Verbatim => "verbatim",
            Stage::Interpretation => "interpretation",
            Stage::IdentifierMint => "identifier-mint",
        };
        f.write_str(name)
    }
}

/// Stage completion times in epoch milliseconds; `None` when the stage has
/// produced no artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTimestamps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbatim: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpretation: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier_mint: Option<u64>,
}

impl StageTimestamps {
    pub fn get(&self, stage: Stage) -> Option<u64> {
        match stage {
            Stage::Verbatim => self.verbatim,
            Stage::Interpretation => self.interpretation,
            Stage::IdentifierMint => self.identifier_mint,
        }
    }
}

/// Integrity counters for one dataset attempt.
///
/// Missing counters read as [`UNKNOWN_COUNT`], missing flags as `false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    #[serde(default)]
    pub metadata_available: bool,
    #[serde(default)]
    pub unique_terms_specified: bool,
    #[serde(default = "unknown_count")]
    pub empty_key_records: i64,
    #[serde(default = "unknown_count")]
    pub duplicate_key_count: i64,
    #[serde(default = "unknown_count")]
    pub duplicate_record_key_count: i64,
    /// Stage times known to the producer when the report was written
    #[serde(default)]
    pub stage_timestamps: StageTimestamps,
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self {
            metadata_available: false,
            unique_terms_specified: false,
            empty_key_records: UNKNOWN_COUNT,
            duplicate_key_count: UNKNOWN_COUNT,
            duplicate_record_key_count: UNKNOWN_COUNT,
            stage_timestamps: StageTimestamps::default(),
        }
    }
}

/// Closed set of gate outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Ok,
    NotValidated,
    MetadataNotAvailable,
    UniqueTermsNotSpecified,
    HasEmptyKeys,
    HasDuplicates,
    UuidRequired,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Ok => "OK",
            ReasonCode::NotValidated => "NOT_VALIDATED",
            ReasonCode::MetadataNotAvailable => "METADATA_NOT_AVAILABLE",
            ReasonCode::UniqueTermsNotSpecified => "UNIQUE_TERMS_NOT_SPECIFIED",
            ReasonCode::HasEmptyKeys => "HAS_EMPTY_KEYS",
            ReasonCode::HasDuplicates => "HAS_DUPLICATES",
            ReasonCode::UuidRequired => "UUID_REQUIRED",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ReasonCode::Ok)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate decision plus any non-blocking timestamp warnings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateVerdict {
    pub reason: ReasonCode,
    pub warnings: Vec<String>,
}

impl GateVerdict {
    fn from_reason(reason: ReasonCode) -> Self {
        Self {
            reason,
            warnings: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.reason.is_ok()
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unreadable report at {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("report encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("missing {stage} artifact for dataset {dataset_id} attempt {attempt}")]
    MissingArtifact {
        dataset_id: String,
        attempt: u32,
        stage: Stage,
    },
}

/// Rules 1 to 5 over a report.
pub fn evaluate_report(report: Option<&ValidationReport>) -> ReasonCode {
    let Some(report) = report else {
        return ReasonCode::NotValidated;
    };
    if !report.metadata_available {
        return ReasonCode::MetadataNotAvailable;
    }
    if !report.unique_terms_specified {
        return ReasonCode::UniqueTermsNotSpecified;
    }

    if report.empty_key_records > 0 {
        warn!(
            empty_key_records = report.empty_key_records,
            "records with empty values for all unique terms"
        );
    }
    if report.empty_key_records != 0 {
        return ReasonCode::HasEmptyKeys;
    }

    if report.duplicate_key_count > 0 {
        warn!(
            duplicate_key_count = report.duplicate_key_count,
            duplicate_record_key_count = report.duplicate_record_key_count,
            "duplicate keys in dataset"
        );
    }
    if report.duplicate_key_count != 0 {
        return ReasonCode::HasDuplicates;
    }
    ReasonCode::Ok
}

/// Rule 6 plus ordering warnings.
///
/// Missing verbatim or interpretation artifacts are errors; a missing
/// identifier-mint artifact means minting never ran.
pub fn evaluate_stage_order(
    dataset_id: &str,
    attempt: u32,
    timestamps: &StageTimestamps,
) -> Result<GateVerdict, GateError> {
    let require = |stage: Stage| {
        timestamps.get(stage).ok_or_else(|| GateError::MissingArtifact {
            dataset_id: dataset_id.to_string(),
            attempt,
            stage,
        })
    };
    let verbatim = require(Stage::Verbatim)?;
    let interpretation = require(Stage::Interpretation)?;

    let mut verdict = GateVerdict::from_reason(ReasonCode::Ok);
    if interpretation < verbatim {
        let msg = "verbatim import is newer than interpretation; interpretation should be re-run";
        warn!(dataset_id, attempt, "{msg}");
        verdict.warnings.push(msg.to_string());
    }

    let Some(minted) = timestamps.identifier_mint else {
        warn!(dataset_id, attempt, "identifier minting has not run");
        verdict.reason = ReasonCode::UuidRequired;
        return Ok(verdict);
    };
    if verbatim > minted {
        let msg = "verbatim import is newer than identifier minting";
        warn!(dataset_id, attempt, "{msg}");
        verdict.warnings.push(msg.to_string());
    }
    if interpretation > minted {
        warn!(
            dataset_id,
            attempt, "interpretation is newer than identifier minting; minting must re-run"
        );
        verdict.reason = ReasonCode::UuidRequired;
    }
    Ok(verdict)
}

/// Where reports and stage timestamps come from.
pub trait ReportSource: Send + Sync {
    fn load_report(
        &self,
        dataset_id: &str,
        attempt: u32,
    ) -> Result<Option<ValidationReport>, GateError>;

    fn stage_timestamps(&self, dataset_id: &str, attempt: u32)
        -> Result<StageTimestamps, GateError>;
}

/// Filesystem layout: `<root>/<dataset>/<attempt>/{validation-report.json, <stage artifacts>}`.
#[derive(Debug, Clone)]
pub struct FsReportSource {
    root: PathBuf,
}

impl FsReportSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn attempt_dir(&self, dataset_id: &str, attempt: u32) -> PathBuf {
        self.root
            .join(dataset_id.trim())
            .join(attempt.to_string())
    }

    pub fn report_path(&self, dataset_id: &str, attempt: u32) -> PathBuf {
        self.attempt_dir(dataset_id, attempt)
            .join(VALIDATION_REPORT_FILE)
    }

    pub fn artifact_path(&self, dataset_id: &str, attempt: u32, stage: Stage) -> PathBuf {
        self.attempt_dir(dataset_id, attempt)
            .join(stage.artifact_name())
    }

    /// Write the report atomically (temp file in the same directory, then rename).
    pub fn write_report(
        &self,
        dataset_id: &str,
        attempt: u32,
        report: &ValidationReport,
    ) -> Result<PathBuf, GateError> {
        let path = self.report_path(dataset_id, attempt);
        let bytes = serde_json::to_vec_pretty(report)?;
        write_atomic(&path, &bytes)?;
        info!(dataset_id, attempt, path = %path.display(), "validation report written");
        Ok(path)
    }

    /// Record completion of `stage`; the artifact's modification time is the
    /// stage timestamp.
    pub fn write_stage_artifact(
        &self,
        dataset_id: &str,
        attempt: u32,
        stage: Stage,
        metrics: &serde_json::Value,
    ) -> Result<PathBuf, GateError> {
        let path = self.artifact_path(dataset_id, attempt, stage);
        let bytes = serde_json::to_vec_pretty(metrics)?;
        write_atomic(&path, &bytes)?;
        debug!(dataset_id, attempt, %stage, "stage artifact written");
        Ok(path)
    }

    pub fn duplicate_keys_path(&self, dataset_id: &str, attempt: u32) -> PathBuf {
        self.attempt_dir(dataset_id, attempt)
            .join(VALIDATION_OUTPUT_DIR)
            .join(DUPLICATE_KEYS_OUTPUT)
    }

    /// Write the duplicated keys as a one-column CSV with a `key` header.
    pub fn write_duplicate_keys(
        &self,
        dataset_id: &str,
        attempt: u32,
        keys: &[CompositeKey],
    ) -> Result<PathBuf, GateError> {
        let path = self.duplicate_keys_path(dataset_id, attempt);
        let mut out = String::from("key\n");
        for key in keys {
            out.push_str(&csv_field(key.as_str()));
            out.push('\n');
        }
        write_atomic(&path, out.as_bytes())?;
        info!(dataset_id, attempt, keys = keys.len(), path = %path.display(), "duplicate keys written");
        Ok(path)
    }

    fn modified_millis(path: &Path) -> Result<Option<u64>, GateError> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(GateError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let modified = metadata.modified().map_err(|source| GateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let millis = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(Some(millis))
    }
}

impl ReportSource for FsReportSource {
    fn load_report(
        &self,
        dataset_id: &str,
        attempt: u32,
    ) -> Result<Option<ValidationReport>, GateError> {
        let path = self.report_path(dataset_id, attempt);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    dataset_id,
                    attempt,
                    path = %path.display(),
                    "validation not completed, no validation report"
                );
                return Ok(None);
            }
            Err(source) => return Err(GateError::Io { path, source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| GateError::Decode { path, source })
    }

    fn stage_timestamps(
        &self,
        dataset_id: &str,
        attempt: u32,
    ) -> Result<StageTimestamps, GateError> {
        let at = |stage| Self::modified_millis(&self.artifact_path(dataset_id, attempt, stage));
        Ok(StageTimestamps {
            verbatim: at(Stage::Verbatim)?,
            interpretation: at(Stage::Interpretation)?,
            identifier_mint: at(Stage::IdentifierMint)?,
        })
    }
}

/// Quote a field when it holds a separator, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), GateError> {
    let io_err = |source| GateError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(io_err)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|err| io_err(err.error))?;
    Ok(())
}

/// Read-only readiness checks over a [`ReportSource`].
pub struct ValidationGate<S> {
    source: S,
}

impl<S: ReportSource> ValidationGate<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Rules 1 to 5.
    pub fn check(&self, dataset_id: &str, attempt: u32) -> Result<GateVerdict, GateError> {
        let report = self.source.load_report(dataset_id, attempt)?;
        Ok(GateVerdict::from_reason(evaluate_report(report.as_ref())))
    }

    /// Rules 1 to 6.
    pub fn check_ready_for_indexing(
        &self,
        dataset_id: &str,
        attempt: u32,
    ) -> Result<GateVerdict, GateError> {
        let verdict = self.check(dataset_id, attempt)?;
        if !verdict.is_ok() {
            return Ok(verdict);
        }
        let timestamps = self.source.stage_timestamps(dataset_id, attempt)?;
        evaluate_stage_order(dataset_id, attempt, &timestamps)
    }
}
