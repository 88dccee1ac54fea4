//! Track FLEXlm license seat usage over time.
//!
//! This library scans FLEXlm license files and `lmstat` output, persists
//! per-feature seat counts into a SQLite history, and reports on that
//! history: tabular/CSV/JSON usage reports, Nagios-style health checks, and
//! per-feature RRD archives for graphing.
//!
//! ## Architecture
//!
//! - [`models`]: the [`Feature`](models::Feature) value object and the
//!   id-ordered, deduplicated [`FeatureSet`](models::FeatureSet) cache
//! - [`predicate`]: composable `WHERE`-clause filters over feature and
//!   usage fields
//! - [`store`]: the [`LicenseDb`](store::LicenseDb) facade with schema,
//!   find-or-create feature reconciliation, and sample commits
//! - [`report`]: aggregated usage queries over the sample history
//! - [`scanner`] / [`parser`]: line scanning and FLEXlm/lmstat parsing
//! - [`ingest`]: the scan-reconcile-commit update pipeline
//! - [`rules`] / [`check`]: monitoring rules and the health check
//! - [`display`]: report rendering
//! - [`rrd`]: per-feature round-robin archives via `rrdtool`
//! - [`config`] / [`logging`]: the shared ambient plumbing
//!
//! ## Filters are parameterized
//!
//! Scanned feature names flow into query filters, so [`predicate`] never
//! splices values into SQL text: every value becomes a bound `?` parameter.
//!
//! ## Example
//!
//! ```no_run
//! use flexlm_usage::report::{Aggregate, RangeFilter};
//! use flexlm_usage::store::LicenseDb;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut db = LicenseDb::open("/var/lib/flexlm-usage.db")?;
//! db.feature_by_name("MATLAB", "MLM", "R2023a")?.add_in_use(7);
//! db.commit_counts(None)?;
//!
//! let mut report = db.usage_report(Aggregate::Total, RangeFilter::None, None)?;
//! report.for_each(|row| {
//!     println!("{}: {} of {} seats", row.feature, row.in_use.avg, row.issued.avg);
//!     true
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod check;
pub mod config;
pub mod display;
pub mod ingest;
pub mod logging;
pub mod models;
pub mod parser;
pub mod predicate;
pub mod report;
pub mod rrd;
pub mod rules;
pub mod scanner;
pub mod store;

pub use models::{Feature, FeatureSet};
pub use predicate::Predicate;
pub use report::{Aggregate, RangeFilter, UsageReport, UsageRow};
pub use store::LicenseDb;
