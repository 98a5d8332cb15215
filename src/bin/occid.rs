use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::ExitCode;

use anyhow::{bail, Context};
use occurrence_identity::config::{
    ConfigOverrides, GateOverrides, IdentityConfig, KeysOverrides, StoreOverrides,
};
use occurrence_identity::gate::{ReportSource, Stage};
use occurrence_identity::validation::validate_records;
use occurrence_identity::{
    DeletionPolicy, FsReportSource, IdentityService, KeyBuilder, OccurrenceRecord,
    ValidationGate,
};
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn require_arg(flag: &str) -> anyhow::Result<String> {
    parse_arg(flag).with_context(|| format!("missing required argument {flag}"))
}

fn print_help() {
    eprintln!(
        r#"occid - stable occurrence identifiers

USAGE:
    occid <COMMAND> [OPTIONS]

COMMANDS:
    validate    Scan a record batch for empty and duplicate keys, write the report and duplicateKeys.csv
    mint        Assign identifiers to a record batch
    check       Evaluate the validation gate for a dataset attempt
    remediate   Resolve collisions between triplet and occurrenceID keys

OPTIONS:
    -c, --config <FILE>         Path to config file (TOML)
        --dataset <ID>          Dataset identifier
        --attempt <N>           Processing attempt [default: 1]
        --records <FILE>        JSON-lines record file ({{"id": .., "terms": {{..}}}})
        --terms <a,b,..>        Override identity terms
        --data-dir <DIR>        Override identity store directory
        --report-root <DIR>     Override report root
        --metadata-available    (validate) dataset metadata is present
        --validation-only       (check) skip the stage timestamp rule
        --policy <P>            (remediate) min | max | occurrenceID | triplet | both
        --only-collisions       (remediate) act only on differing identifiers
        --dry-run               (remediate) report without deleting
    -h, --help                  Print help

ENVIRONMENT:
    OCCID_CONFIG                Path to config file
    OCCID_LOCKS__WAIT_MS        Per-attempt lock wait
    OCCID_STORE__DATA_DIR       Identity store directory
    RUST_LOG                    Log filter
"#
    );
}

/// Lazily parse a JSON-lines record file, skipping blank lines.
fn read_records(
    path: &Path,
) -> anyhow::Result<impl Iterator<Item = anyhow::Result<OccurrenceRecord>> + '_> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(BufReader::new(file)
        .lines()
        .enumerate()
        .filter_map(move |(line_no, line)| {
            let line = match line {
                Ok(line) => line,
                Err(err) => return Some(Err(anyhow::Error::from(err))),
            };
            if line.trim().is_empty() {
                return None;
            }
            Some(serde_json::from_str::<OccurrenceRecord>(&line).with_context(|| {
                format!("{}:{}: invalid record", path.display(), line_no + 1)
            }))
        }))
}

fn load_records(path: &Path) -> anyhow::Result<Vec<OccurrenceRecord>> {
    read_records(path)?.collect()
}

fn load_config() -> anyhow::Result<IdentityConfig> {
    let mut overrides = ConfigOverrides::default();
    if let Some(terms) = parse_arg("--terms") {
        overrides.keys = Some(KeysOverrides {
            unique_terms: Some(terms.split(',').map(|t| t.trim().to_string()).collect()),
        });
    }
    if let Some(dir) = parse_arg("--data-dir") {
        overrides.store = Some(StoreOverrides {
            data_dir: Some(dir.into()),
            repair: None,
        });
    }
    if let Some(root) = parse_arg("--report-root") {
        overrides.gate = Some(GateOverrides {
            report_root: Some(root.into()),
        });
    }

    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("OCCID_CONFIG").ok());
    Ok(IdentityConfig::load(config_path.as_deref(), overrides)?)
}

fn attempt() -> anyhow::Result<u32> {
    Ok(parse_arg("--attempt")
        .unwrap_or_else(|| "1".to_string())
        .parse()
        .context("--attempt must be a positive integer")?)
}

fn run_validate(config: &IdentityConfig) -> anyhow::Result<ExitCode> {
    let dataset = require_arg("--dataset")?;
    let attempt = attempt()?;
    let records_path = require_arg("--records")?;
    let builder = KeyBuilder::new(&dataset, config.keys.terms());

    // The scan stops at the first unreadable line; that error wins over the result.
    let mut read_error = None;
    let records = read_records(Path::new(&records_path))?.map_while(|record| match record {
        Ok(record) => Some(record),
        Err(err) => {
            read_error = Some(err);
            None
        }
    });
    let scanned = validate_records(
        &builder,
        records,
        has_flag("--metadata-available"),
        &config.uniqueness,
    );
    if let Some(err) = read_error {
        return Err(err);
    }
    let mut result = scanned?;

    let reports = FsReportSource::new(&config.gate.report_root);
    if !reports
        .artifact_path(&dataset, attempt, Stage::Verbatim)
        .exists()
    {
        reports.write_stage_artifact(
            &dataset,
            attempt,
            Stage::Verbatim,
            &serde_json::json!({ "records": result.records_scanned }),
        )?;
    }
    reports.write_stage_artifact(
        &dataset,
        attempt,
        Stage::Interpretation,
        &serde_json::json!({
            "records": result.records_scanned,
            "emptyKeyRecords": result.report.empty_key_records,
            "duplicateKeyCount": result.report.duplicate_key_count,
        }),
    )?;
    result.report.stage_timestamps = reports.stage_timestamps(&dataset, attempt)?;
    reports.write_report(&dataset, attempt, &result.report)?;
    reports.write_duplicate_keys(&dataset, attempt, &result.duplicate_keys)?;

    println!("{}", serde_json::to_string_pretty(&result.report)?);
    for key in &result.duplicate_keys {
        eprintln!("duplicate key: {key}");
    }
    Ok(ExitCode::SUCCESS)
}

fn run_mint(config: &IdentityConfig) -> anyhow::Result<ExitCode> {
    let dataset = require_arg("--dataset")?;
    let attempt = attempt()?;
    let records = load_records(Path::new(&require_arg("--records")?))?;
    let service = IdentityService::open(&dataset, config)?;

    let summary = service.mint_batch(&records);
    let metrics = service.store().metrics();
    FsReportSource::new(&config.gate.report_root).write_stage_artifact(
        &dataset,
        attempt,
        Stage::IdentifierMint,
        &serde_json::json!({
            "assigned": summary.assignments.len(),
            "failed": summary.failures.len(),
            "minted": metrics.minted,
            "lockTimeouts": metrics.lock_timeouts,
        }),
    )?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.failures.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn run_check(config: &IdentityConfig) -> anyhow::Result<ExitCode> {
    let dataset = require_arg("--dataset")?;
    let attempt = attempt()?;
    let gate = ValidationGate::new(FsReportSource::new(&config.gate.report_root));

    let verdict = if has_flag("--validation-only") {
        gate.check(&dataset, attempt)?
    } else {
        gate.check_ready_for_indexing(&dataset, attempt)?
    };
    println!("{}", verdict.reason);
    for warning in &verdict.warnings {
        eprintln!("warning: {warning}");
    }
    if verdict.is_ok() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(2))
    }
}

fn run_remediate(config: &IdentityConfig) -> anyhow::Result<ExitCode> {
    let dataset = require_arg("--dataset")?;
    let policy: DeletionPolicy = require_arg("--policy")?.parse()?;
    let records = load_records(Path::new(&require_arg("--records")?))?;
    let service = IdentityService::open(&dataset, config)?;

    let report = service.remediate(
        &records,
        policy,
        has_flag("--only-collisions"),
        has_flag("--dry-run"),
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.failures.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let command = std::env::args().nth(1);
    if has_flag("-h") || has_flag("--help") || command.is_none() {
        print_help();
        return Ok(ExitCode::SUCCESS);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = load_config()?;
    match command.as_deref() {
        Some("validate") => run_validate(&config),
        Some("mint") => run_mint(&config),
        Some("check") => run_check(&config),
        Some("remediate") => run_remediate(&config),
        Some(other) => bail!("unknown command '{other}', see --help"),
        None => Ok(ExitCode::SUCCESS),
    }
}
