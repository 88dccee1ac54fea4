//! Nagios-style health check over the usage history.
//!
//! Three passes produce one status line. The usage pass looks at the most
//! recent scan and flags features whose seat consumption breaches a warning
//! or critical threshold, with per-feature overrides coming from the
//! monitoring rules. The data-age pass makes sure the history is still being
//! fed at all. The expiration pass walks the whole history and flags
//! licenses that have expired or are about to.
//!
//! The worst finding wins: `OK` < `WARNING` < `CRITICAL` < `UNKNOWN`, with
//! exit codes 0 to 3 as monitoring systems expect.

use std::fmt;

use anyhow::Result;

use crate::report::{Aggregate, RangeFilter, UsageRow};
use crate::rules::{RuleDecision, RuleSet, Threshold};
use crate::store::LicenseDb;

const EXPIRY_WARNING_SECS: i64 = 30 * 86_400;
const EXPIRY_CRITICAL_SECS: i64 = 7 * 86_400;

/// Nagios service status, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl Status {
    pub fn exit_code(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::Warning => 1,
            Status::Critical => 2,
            Status::Unknown => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Warning => "WARNING",
            Status::Critical => "CRITICAL",
            Status::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Thresholds and rules the check runs with.
#[derive(Debug)]
pub struct CheckSettings {
    /// Default warning threshold when no rule overrides it.
    pub warn: Threshold,
    /// Default critical threshold when no rule overrides it.
    pub crit: Threshold,
    /// Maximum age of the newest sample before the data counts as stale.
    pub maximum_data_age: i64,
    pub rules: Option<RuleSet>,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            warn: Threshold::Fraction(0.95),
            crit: Threshold::Fraction(0.99),
            maximum_data_age: 3_600,
            rules: None,
        }
    }
}

/// The verdict plus the single line reported to the monitoring system.
#[derive(Debug)]
pub struct CheckOutput {
    pub status: Status,
    pub message: String,
}

impl CheckOutput {
    /// The full `STATUS: details` service line.
    pub fn line(&self) -> String {
        format!("{}: {}", self.status.label(), self.message)
    }
}

/// Run all three passes against the database as of `now`.
pub fn run_check(db: &LicenseDb, settings: &CheckSettings, now: i64) -> Result<CheckOutput> {
    let mut findings: Vec<(Status, String)> = Vec::new();

    check_usage_and_age(db, settings, now, &mut findings)?;
    check_expirations(db, now, &mut findings)?;

    let status = findings
        .iter()
        .map(|(status, _)| *status)
        .max()
        .unwrap_or(Status::Ok);
    let message = if findings.is_empty() {
        "no expired licenses or usage threshold problems".to_string()
    } else {
        findings
            .into_iter()
            .map(|(_, message)| message)
            .collect::<Vec<_>>()
            .join("; ")
    };
    Ok(CheckOutput { status, message })
}

fn check_usage_and_age(
    db: &LicenseDb,
    settings: &CheckSettings,
    now: i64,
    findings: &mut Vec<(Status, String)>,
) -> Result<()> {
    let mut report = db.usage_report(Aggregate::None, RangeFilter::LastCheck, None)?;
    let rows = report.rows()?;
    if rows.is_empty() {
        findings.push((
            Status::Critical,
            "no feature counts found in database".to_string(),
        ));
        return Ok(());
    }

    let mut newest = i64::MIN;
    for row in &rows {
        newest = newest.max(row.checked.end);

        let tuple = format!("{}:{}:{}", row.feature, row.vendor, row.version);
        let (mut warn, mut crit) = (settings.warn, settings.crit);
        if let Some(rules) = &settings.rules {
            match rules.apply(&tuple) {
                RuleDecision::Exclude => continue,
                RuleDecision::Include {
                    warn: rule_warn,
                    crit: rule_crit,
                } => {
                    warn = rule_warn.unwrap_or(warn);
                    crit = rule_crit.unwrap_or(crit);
                }
                RuleDecision::Decline => {}
            }
        }

        let (in_use, issued) = (row.in_use.avg, row.issued.avg);
        if crit.is_breached(in_use, issued) {
            findings.push((Status::Critical, usage_message(row)));
        } else if warn.is_breached(in_use, issued) {
            findings.push((Status::Warning, usage_message(row)));
        }
    }

    let age = now - newest;
    if age > settings.maximum_data_age {
        findings.push((
            Status::Critical,
            format!("usage counts data is {} old", humanize_age(age)),
        ));
    }
    Ok(())
}

fn check_expirations(db: &LicenseDb, now: i64, findings: &mut Vec<(Status, String)>) -> Result<()> {
    let mut report = db.usage_report(Aggregate::Total, RangeFilter::None, None)?;
    report.for_each(|row| {
        let Some(expiration) = row.expiration else {
            return true;
        };
        let remaining = expiration - now;
        if remaining <= 0 {
            findings.push((Status::Critical, format!("{} has expired", feature_label(&row))));
        } else if remaining <= EXPIRY_CRITICAL_SECS {
            findings.push((Status::Critical, expiry_message(&row, remaining)));
        } else if remaining <= EXPIRY_WARNING_SECS {
            findings.push((Status::Warning, expiry_message(&row, remaining)));
        }
        true
    })?;
    Ok(())
}

fn feature_label(row: &UsageRow) -> String {
    format!("{} ({} v{})", row.feature, row.vendor, row.version)
}

fn usage_message(row: &UsageRow) -> String {
    let (in_use, issued) = (row.in_use.avg, row.issued.avg);
    format!(
        "{} {}/{} ({}%)",
        feature_label(row),
        in_use,
        issued,
        percent_used(in_use, issued)
    )
}

fn expiry_message(row: &UsageRow, remaining: i64) -> String {
    let days = remaining / 86_400;
    let rest = remaining % 86_400;
    format!(
        "{} will expire in {}d {:02}:{:02}:{:02}",
        feature_label(row),
        days,
        rest / 3_600,
        rest % 3_600 / 60,
        rest % 60
    )
}

/// Seats used as a percentage, rounded up so 1 seat of 1000 still shows 1%.
pub fn percent_used(in_use: i64, issued: i64) -> i64 {
    if issued <= 0 {
        0
    } else {
        (100 * in_use + issued - 1) / issued
    }
}

fn humanize_age(seconds: i64) -> String {
    if seconds < 120 {
        format!("{seconds} seconds")
    } else if seconds < 7_200 {
        format!("{} minutes", seconds / 60)
    } else if seconds < 172_800 {
        format!("{} hours", seconds / 3_600)
    } else {
        format!("{} days", seconds / 86_400)
    }
}
