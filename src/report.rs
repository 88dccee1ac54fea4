//! Usage report queries over the sample history.
//!
//! A [`UsageReport`] is a prepared SQL query joining `counts` with `features`,
//! optionally bucketing samples into calendar periods ([`Aggregate`]) and
//! optionally restricting them to a trailing window or the most recent scan
//! ([`RangeFilter`]). Aggregated buckets carry min/max/avg triplets for the
//! seat counters and the first/last check timestamp of the bucket.
//!
//! Calendar buckets follow SQLite's `strftime` in the local time zone, so a
//! "day" is a local calendar day rather than a sliding 24-hour window. The
//! relative ranges are fixed spans of seconds counted back from the current
//! time; a "month" is always 30 days and a "year" 365 days.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use rusqlite::{params_from_iter, Connection, Row, Statement};
use tracing::debug;

use crate::predicate::{Predicate, Value};

const REPORT_BASE_PLAIN: &str = "SELECT f.feature_id, f.vendor, f.version, f.feature_string, \
     c.in_use, c.issued, \
     c.checked_timestamp AS start_timestamp, \
     c.expiration_timestamp AS expiration_timestamp \
     FROM counts AS c INNER JOIN features AS f ON (f.feature_id = c.feature_id)";

const REPORT_BASE_AGGREGATED: &str = "SELECT f.feature_id, f.vendor, f.version, f.feature_string, \
     MIN(c.in_use) AS in_use_min, MAX(c.in_use) AS in_use_max, AVG(c.in_use) AS in_use_avg, \
     MIN(c.issued) AS issued_min, MAX(c.issued) AS issued_max, AVG(c.issued) AS issued_avg, \
     MIN(c.checked_timestamp) AS start_timestamp, MAX(c.checked_timestamp) AS end_timestamp, \
     MAX(c.expiration_timestamp) AS expiration_timestamp \
     FROM counts AS c INNER JOIN features AS f ON (f.feature_id = c.feature_id)";

const REPORT_ORDER_BY: &str = " ORDER BY start_timestamp ASC, f.vendor, f.version, f.feature_string";

/// How samples are bucketed before the min/max/avg summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    /// Every sample row is reported as-is.
    None,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
    /// One bucket per feature spanning the whole selected range.
    Total,
}

impl Aggregate {
    pub fn as_str(self) -> &'static str {
        match self {
            Aggregate::None => "none",
            Aggregate::Hourly => "hourly",
            Aggregate::Daily => "daily",
            Aggregate::Weekly => "weekly",
            Aggregate::Monthly => "monthly",
            Aggregate::Yearly => "yearly",
            Aggregate::Total => "total",
        }
    }

    /// Local-time `strftime` format that names a sample's calendar bucket.
    fn bucket_format(self) -> Option<&'static str> {
        match self {
            Aggregate::Hourly => Some("%Y%m%d%H"),
            Aggregate::Daily => Some("%Y%m%d"),
            Aggregate::Weekly => Some("%Y%W"),
            Aggregate::Monthly => Some("%Y%m"),
            Aggregate::Yearly => Some("%Y"),
            Aggregate::None | Aggregate::Total => None,
        }
    }

    fn group_by(self) -> Option<String> {
        match self {
            Aggregate::None => None,
            Aggregate::Total => {
                Some("GROUP BY c.feature_id, f.vendor, f.version, f.feature_string".to_string())
            }
            _ => self.bucket_format().map(|format| {
                format!(
                    "GROUP BY strftime('{format}', c.checked_timestamp, 'unixepoch', 'localtime'), \
                     c.feature_id, f.vendor, f.version, f.feature_string"
                )
            }),
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Aggregate::None),
            "hourly" => Ok(Aggregate::Hourly),
            "daily" => Ok(Aggregate::Daily),
            "weekly" => Ok(Aggregate::Weekly),
            "monthly" => Ok(Aggregate::Monthly),
            "yearly" => Ok(Aggregate::Yearly),
            "total" => Ok(Aggregate::Total),
            other => Err(format!(
                "unknown aggregate '{other}' (expected none, hourly, daily, weekly, monthly, yearly, or total)"
            )),
        }
    }
}

/// Which samples participate in the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeFilter {
    /// All samples.
    None,
    /// Only samples from the most recent scan recorded anywhere in the table.
    LastCheck,
    LastHour,
    LastDay,
    LastWeek,
    LastMonth,
    LastYear,
}

impl RangeFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            RangeFilter::None => "none",
            RangeFilter::LastCheck => "last_check",
            RangeFilter::LastHour => "hour",
            RangeFilter::LastDay => "day",
            RangeFilter::LastWeek => "week",
            RangeFilter::LastMonth => "month",
            RangeFilter::LastYear => "year",
        }
    }

    /// Width of the trailing window in seconds, for the relative filters.
    pub fn span_seconds(self) -> Option<i64> {
        match self {
            RangeFilter::None | RangeFilter::LastCheck => None,
            RangeFilter::LastHour => Some(3_600),
            RangeFilter::LastDay => Some(86_400),
            RangeFilter::LastWeek => Some(604_800),
            RangeFilter::LastMonth => Some(2_592_000),
            RangeFilter::LastYear => Some(31_536_000),
        }
    }

    fn where_sql(self) -> Option<String> {
        match self {
            RangeFilter::None => None,
            RangeFilter::LastCheck => Some(
                "c.checked_timestamp = (SELECT MAX(checked_timestamp) FROM counts)".to_string(),
            ),
            _ => self
                .span_seconds()
                .map(|span| format!("strftime('%s', 'now') - c.checked_timestamp <= {span}")),
        }
    }
}

impl fmt::Display for RangeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RangeFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "none" => Ok(RangeFilter::None),
            "last_check" => Ok(RangeFilter::LastCheck),
            "hour" => Ok(RangeFilter::LastHour),
            "day" => Ok(RangeFilter::LastDay),
            "week" => Ok(RangeFilter::LastWeek),
            "month" => Ok(RangeFilter::LastMonth),
            "year" => Ok(RangeFilter::LastYear),
            other => Err(format!(
                "unknown range '{other}' (expected none, last_check, hour, day, week, month, or year)"
            )),
        }
    }
}

/// Min/max/avg summary of a seat counter within one bucket.
///
/// Unaggregated rows carry the same value in all three slots. The average is
/// truncated to whole seats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntRange {
    pub min: i64,
    pub max: i64,
    pub avg: i64,
}

impl IntRange {
    fn scalar(value: i64) -> Self {
        Self {
            min: value,
            max: value,
            avg: value,
        }
    }

    /// True when every sample in the bucket had the same value.
    pub fn is_uniform(&self) -> bool {
        self.min == self.max
    }
}

/// First and last check timestamp covered by one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

/// One report row: a single sample, or one bucket of samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRow {
    pub feature_id: i64,
    pub vendor: String,
    pub version: String,
    pub feature: String,
    pub in_use: IntRange,
    pub issued: IntRange,
    pub expiration: Option<i64>,
    pub checked: TimeRange,
}

/// A prepared usage report that can be iterated repeatedly.
pub struct UsageReport<'db> {
    stmt: Statement<'db>,
    params: Vec<Value>,
    aggregate: Aggregate,
}

impl<'db> UsageReport<'db> {
    pub(crate) fn new(
        conn: &'db Connection,
        aggregate: Aggregate,
        range: RangeFilter,
        predicate: Option<&Predicate>,
    ) -> Result<Self> {
        let base = match aggregate {
            Aggregate::None => REPORT_BASE_PLAIN,
            _ => REPORT_BASE_AGGREGATED,
        };

        let (mut where_clause, params) = match predicate {
            Some(predicate) => predicate.to_sql(),
            None => (String::new(), Vec::new()),
        };
        if let Some(range_sql) = range.where_sql() {
            if where_clause.is_empty() {
                where_clause = range_sql;
            } else {
                where_clause.push_str(" AND ");
                where_clause.push_str(&range_sql);
            }
        }

        let mut sql = String::from(base);
        if !where_clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause);
        }
        if let Some(group_by) = aggregate.group_by() {
            sql.push(' ');
            sql.push_str(&group_by);
        }
        sql.push_str(REPORT_ORDER_BY);

        debug!(query = %sql, "usage report");
        let stmt = conn
            .prepare(&sql)
            .with_context(|| format!("failed to prepare usage report: {sql}"))?;
        Ok(Self {
            stmt,
            params,
            aggregate,
        })
    }

    /// Visit every report row in order. The callback returns `false` to stop
    /// early, which is reported as `Ok(false)`.
    ///
    /// The underlying statement resets afterwards, so a report can be run
    /// more than once.
    pub fn for_each(&mut self, mut visit: impl FnMut(UsageRow) -> bool) -> Result<bool> {
        let aggregate = self.aggregate;
        let mut rows = self
            .stmt
            .query(params_from_iter(self.params.iter()))
            .context("usage report query failed")?;
        while let Some(row) = rows.next().context("failed to read usage report row")? {
            let usage = row_to_usage(aggregate, row).context("failed to decode usage report row")?;
            if !visit(usage) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Collect the whole report into memory.
    pub fn rows(&mut self) -> Result<Vec<UsageRow>> {
        let mut collected = Vec::new();
        self.for_each(|row| {
            collected.push(row);
            true
        })?;
        Ok(collected)
    }
}

fn row_to_usage(aggregate: Aggregate, row: &Row<'_>) -> rusqlite::Result<UsageRow> {
    let feature_id: i64 = row.get(0)?;
    let vendor: Option<String> = row.get(1)?;
    let version: Option<String> = row.get(2)?;
    let feature: Option<String> = row.get(3)?;

    let (in_use, issued, checked, expiration) = if aggregate == Aggregate::None {
        let checked: i64 = row.get(6)?;
        (
            IntRange::scalar(row.get(4)?),
            IntRange::scalar(row.get(5)?),
            TimeRange {
                start: checked,
                end: checked,
            },
            row.get(7)?,
        )
    } else {
        (
            // AVG() yields a float; seat counts truncate to whole numbers.
            IntRange {
                min: row.get(4)?,
                max: row.get(5)?,
                avg: row.get::<_, f64>(6)? as i64,
            },
            IntRange {
                min: row.get(7)?,
                max: row.get(8)?,
                avg: row.get::<_, f64>(9)? as i64,
            },
            TimeRange {
                start: row.get(10)?,
                end: row.get(11)?,
            },
            row.get(12)?,
        )
    };

    Ok(UsageRow {
        feature_id,
        vendor: vendor.unwrap_or_default(),
        version: version.unwrap_or_default(),
        feature: feature.unwrap_or_default(),
        in_use,
        issued,
        expiration,
        checked,
    })
}
