//! The update pipeline: scan, reconcile, commit.
//!
//! One update pass scans the configured license file and lmstat source,
//! folds every observation into the database through the find-or-create
//! cache, and commits a usage sample for each feature that was touched. A
//! single feature is observed from both sides: the license file declares its
//! seats and the lmstat output reports the checkouts, and because both scans
//! resolve the same natural key to the same cached [`Feature`] the counters
//! accumulate instead of overwriting each other.
//!
//! [`Feature`]: crate::models::Feature

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::parser::{self, LmstatParser};
use crate::scanner::LineScanner;
use crate::store::{CommitOutcome, LicenseDb};

/// Where lmstat output comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LmstatSource {
    /// A file holding captured lmstat output.
    File(PathBuf),
    /// A shell command whose stdout is lmstat output.
    Shell(String),
    /// A program run directly with arguments.
    Exec(String, Vec<String>),
}

impl LmstatSource {
    fn open(&self) -> Result<LineScanner> {
        match self {
            LmstatSource::File(path) => LineScanner::open(path),
            LmstatSource::Shell(command) => LineScanner::shell(command),
            LmstatSource::Exec(program, args) => LineScanner::program(program, args),
        }
    }
}

/// Scan a FLEXlm license file, accumulating issued seats and expirations.
///
/// Returns the number of feature declarations applied. Lines that match the
/// feature shape but fail to decode are logged and skipped; the rest of the
/// file is still scanned.
pub fn scan_license_file(db: &mut LicenseDb, path: impl AsRef<Path>) -> Result<usize> {
    let path = path.as_ref();
    let mut scanner = LineScanner::open(path)
        .with_context(|| format!("failed to open license file {}", path.display()))?;
    scanner.set_filter(parser::license_filter());

    let mut applied = 0;
    while let Some(line) = scanner.next_line()? {
        let observation = match parser::parse_license_line(&line) {
            Ok(observation) => observation,
            Err(err) => {
                warn!(
                    file = %path.display(),
                    line = scanner.line_number(),
                    error = %format!("{err:#}"),
                    "skipping malformed license line"
                );
                continue;
            }
        };
        debug!(
            feature = %observation.feature,
            vendor = %observation.vendor,
            version = %observation.version,
            issued = observation.issued,
            "license declaration"
        );
        let feature = db.feature_by_name(
            &observation.feature,
            &observation.vendor,
            &observation.version,
        )?;
        feature.add_issued(observation.issued);
        feature.set_expiration(observation.expiration);
        applied += 1;
    }
    info!(file = %path.display(), features = applied, "scanned license file");
    Ok(applied)
}

/// Scan lmstat output, accumulating seats in use.
///
/// The issued count from a summary line only overrides the license file's
/// declaration when it is positive; lmstat reports zero issued seats for
/// features it cannot resolve.
pub fn scan_lmstat(db: &mut LicenseDb, source: &LmstatSource) -> Result<usize> {
    let mut scanner = source.open().context("failed to open lmstat source")?;
    scanner.set_filter(parser::lmstat_filter());
    let mut parser = LmstatParser::new();

    let mut applied = 0;
    while let Some(line) = scanner.next_line()? {
        let observation = match parser.push(&line) {
            Ok(Some(observation)) => observation,
            Ok(None) => continue,
            Err(err) => {
                warn!(
                    line = scanner.line_number(),
                    error = %format!("{err:#}"),
                    "skipping malformed lmstat line"
                );
                continue;
            }
        };
        debug!(
            feature = %observation.feature,
            in_use = observation.in_use,
            issued = observation.issued,
            "lmstat observation"
        );
        let feature = db.feature_by_name(
            &observation.feature,
            &observation.vendor,
            &observation.version,
        )?;
        feature.add_in_use(observation.in_use);
        if observation.issued > 0 {
            feature.set_issued(observation.issued);
        }
        feature.set_expiration(observation.expiration);
        applied += 1;
    }
    parser.finish();
    info!(features = applied, "scanned lmstat output");
    Ok(applied)
}

/// Run one full update pass and commit the results.
pub fn run_update(
    db: &mut LicenseDb,
    license_file: Option<&Path>,
    lmstat: Option<&LmstatSource>,
    check_timestamp: Option<i64>,
) -> Result<CommitOutcome> {
    if let Some(path) = license_file {
        scan_license_file(db, path)?;
    }
    if let Some(source) = lmstat {
        scan_lmstat(db, source)?;
    }
    let outcome = db.commit_counts(check_timestamp)?;
    info!(
        committed = outcome.committed,
        failed = outcome.failed.len(),
        "committed usage samples"
    );
    Ok(outcome)
}
