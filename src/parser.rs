//! FLEXlm text parsing.
//!
//! Two kinds of input feed the database: license definition files, whose
//! `FEATURE`/`INCREMENT` lines declare how many seats of a feature exist, and
//! `lmstat -a` output, which reports how many of those seats are checked out
//! right now. Both are matched line by line with anchored regexes; anything
//! that does not match is skipped by the scanner's filter.
//!
//! lmstat spreads one observation over two lines. A summary line
//!
//! ```text
//! Users of MATLAB:  (Total of 10 licenses issued;  Total of 7 licenses in use)
//! ```
//!
//! names the feature and its counts, and the detail line that follows
//!
//! ```text
//! "MATLAB" v1.0, vendor: MLM, expiry: 30-jun-2026
//! ```
//!
//! supplies the vendor, version, and expiration needed to complete the
//! natural key. [`LmstatParser`] pairs the two; a summary whose detail line
//! never arrives is dropped at end of input.

use anyhow::{anyhow, Context, Result};
use chrono::{Datelike, Local, NaiveDate, NaiveTime, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::scanner::ScanLine;

/// License-file feature declarations. Groups: 1 feature, 2 vendor,
/// 3 version, 4 expiration, 6 issued count.
static LICENSE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:FEATURE|INCREMENT)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\d{1,2}-\w{3}-(\d{1,4})|permanent)\s+(\d+)",
    )
    .expect("license line regex must compile")
});

/// Both lmstat line shapes in one alternation. Groups 1-3 belong to the
/// summary line (feature, issued, in use); groups 4-7 to the detail line
/// (feature, version, vendor, expiration).
static LMSTAT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)Users of ([^:]+):.*Total of ([0-9]+) licenses? issued;\s+Total of ([0-9]+) licenses? in use|"([^"]+)"\s+v([^,]+),\s+vendor:\s+([^,]+),\s+expiry:\s+(\d{1,2}-\w{3}-\d{1,4}|permanent)"#,
    )
    .expect("lmstat line regex must compile")
});

/// Filter regex matching license-file feature lines.
pub fn license_filter() -> Regex {
    LICENSE_LINE.clone()
}

/// Filter regex matching both lmstat line shapes.
pub fn lmstat_filter() -> Regex {
    LMSTAT_LINE.clone()
}

/// One `FEATURE`/`INCREMENT` declaration from a license file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseObservation {
    pub feature: String,
    pub vendor: String,
    pub version: String,
    /// Unix timestamp; `None` means the license is permanent.
    pub expiration: Option<i64>,
    pub issued: i64,
}

/// One completed two-line lmstat observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageObservation {
    pub feature: String,
    pub vendor: String,
    pub version: String,
    pub expiration: Option<i64>,
    pub issued: i64,
    pub in_use: i64,
}

/// Parse an expiration field: `permanent` (any case) and the all-zero year
/// FLEXlm uses for uncounted licenses both mean no expiration; anything else
/// must be a `dd-mmm-yyyy` date, taken as local midnight.
pub fn parse_expiration(text: &str) -> Result<Option<i64>> {
    if text.eq_ignore_ascii_case("permanent") {
        return Ok(None);
    }
    let date = NaiveDate::parse_from_str(text, "%d-%b-%Y")
        .with_context(|| format!("invalid expiration date '{text}'"))?;
    if date.year() == 0 {
        return Ok(None);
    }
    let midnight = date.and_time(NaiveTime::MIN);
    let local = Local
        .from_local_datetime(&midnight)
        .earliest()
        .or_else(|| Local.from_local_datetime(&midnight).latest())
        .ok_or_else(|| anyhow!("expiration date '{text}' does not exist in the local time zone"))?;
    Ok(Some(local.timestamp()))
}

/// Decode a license-file line delivered through [`license_filter`].
pub fn parse_license_line(line: &ScanLine<'_>) -> Result<LicenseObservation> {
    let field = |index: usize| {
        line.capture(index)
            .ok_or_else(|| anyhow!("license line is missing capture group {index}"))
    };
    let expiration = parse_expiration(field(4)?)?;
    let issued: i64 = field(6)?
        .parse()
        .context("license line has a non-numeric seat count")?;
    Ok(LicenseObservation {
        feature: field(1)?.to_string(),
        vendor: field(2)?.to_string(),
        version: field(3)?.to_string(),
        expiration,
        issued,
    })
}

/// Pairs lmstat summary lines with the detail lines that follow them.
#[derive(Debug, Default)]
pub struct LmstatParser {
    pending: Option<PendingUsage>,
}

#[derive(Debug)]
struct PendingUsage {
    feature: String,
    issued: i64,
    in_use: i64,
}

impl LmstatParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line delivered through [`lmstat_filter`].
    ///
    /// Returns a completed observation when a detail line matches the stashed
    /// summary. A summary line arriving while another is pending replaces it;
    /// a detail line naming a different feature than the pending summary
    /// discards both.
    pub fn push(&mut self, line: &ScanLine<'_>) -> Result<Option<UsageObservation>> {
        if let Some(feature) = line.capture(1) {
            if let Some(stale) = self.pending.take() {
                debug!(feature = %stale.feature, "lmstat summary line had no detail line");
            }
            let issued: i64 = line
                .capture(2)
                .ok_or_else(|| anyhow!("lmstat summary line is missing its issued count"))?
                .parse()
                .context("lmstat summary line has a non-numeric issued count")?;
            let in_use: i64 = line
                .capture(3)
                .ok_or_else(|| anyhow!("lmstat summary line is missing its in-use count"))?
                .parse()
                .context("lmstat summary line has a non-numeric in-use count")?;
            self.pending = Some(PendingUsage {
                feature: feature.trim().to_string(),
                issued,
                in_use,
            });
            return Ok(None);
        }

        let feature = line
            .capture(4)
            .ok_or_else(|| anyhow!("lmstat line matched neither shape"))?;
        let Some(pending) = self.pending.take() else {
            debug!(feature, "lmstat detail line without a preceding summary");
            return Ok(None);
        };
        if pending.feature != feature {
            debug!(
                expected = %pending.feature,
                got = feature,
                "lmstat detail line names a different feature than its summary"
            );
            return Ok(None);
        }

        let field = |index: usize| {
            line.capture(index)
                .ok_or_else(|| anyhow!("lmstat detail line is missing capture group {index}"))
        };
        let expiration = parse_expiration(field(7)?)?;
        Ok(Some(UsageObservation {
            feature: pending.feature,
            vendor: field(6)?.to_string(),
            version: field(5)?.to_string(),
            expiration,
            issued: pending.issued,
            in_use: pending.in_use,
        }))
    }

    /// Drop any summary still waiting for its detail line.
    pub fn finish(&mut self) {
        if let Some(stale) = self.pending.take() {
            debug!(feature = %stale.feature, "lmstat input ended with an unpaired summary line");
        }
    }
}
