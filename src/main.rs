//! Command-line front end: `update`, `ls`, `report`, and `check`.

use std::io::Write;
use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};

use flexlm_usage::check::{self, CheckSettings};
use flexlm_usage::config::Config;
use flexlm_usage::display::{self, FieldSelection, OutputFormat, RenderOptions};
use flexlm_usage::ingest::{self, LmstatSource};
use flexlm_usage::logging;
use flexlm_usage::predicate::{Combiner, Field, Operator, Predicate, Value};
use flexlm_usage::report::{Aggregate, RangeFilter};
use flexlm_usage::rrd::RrdRepository;
use flexlm_usage::rules::{RuleSet, Threshold};
use flexlm_usage::store::LicenseDb;

#[derive(Parser)]
#[command(name = "flexlm-usage")]
#[command(about = "Track FLEXlm license seat usage over time")]
#[command(version)]
struct Cli {
    /// Config file to load instead of the well-known locations
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// License usage database
    #[arg(long, global = true, value_name = "FILE")]
    database: Option<PathBuf>,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log to a file instead of stderr
    #[arg(long, global = true, value_name = "FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan license and lmstat sources and commit a usage sample
    Update {
        /// FLEXlm license file to scan for issued seats
        #[arg(long, value_name = "FILE")]
        license_file: Option<PathBuf>,
        /// File holding captured lmstat output
        #[arg(long, value_name = "FILE")]
        lmstat_file: Option<PathBuf>,
        /// Shell command producing lmstat output
        #[arg(long, value_name = "CMD", conflicts_with = "lmstat_file")]
        lmstat_command: Option<String>,
        /// Directory of per-feature RRD archives to keep updated
        #[arg(long, value_name = "DIR")]
        rrd_dir: Option<PathBuf>,
    },
    /// List the features known to the database
    Ls {
        /// Only list the feature with this id
        #[arg(long)]
        id: Option<i64>,
        /// Print feature names only
        #[arg(long)]
        name_only: bool,
        #[command(flatten)]
        matches: MatchArgs,
    },
    /// Report usage history
    Report {
        /// Bucketing applied to samples: none, hourly, daily, weekly,
        /// monthly, yearly, or total
        #[arg(long)]
        aggregate: Option<Aggregate>,
        /// Which samples participate: none, last_check, hour, day, week,
        /// month, or year
        #[arg(long)]
        range: Option<RangeFilter>,
        /// Output format: column, csv, or json
        #[arg(long)]
        format: Option<OutputFormat>,
        /// Suppress the header lines
        #[arg(long)]
        no_headers: bool,
        /// Include the feature id column
        #[arg(long)]
        show_id: bool,
        /// Drop the seat count columns
        #[arg(long)]
        no_counts: bool,
        /// Drop the percentage column
        #[arg(long)]
        no_percent: bool,
        /// Drop the expiration column
        #[arg(long)]
        no_expiration: bool,
        /// Drop the check time column
        #[arg(long)]
        no_checked: bool,
        /// Only samples checked at or after this Unix timestamp
        #[arg(long, value_name = "TIMESTAMP")]
        start: Option<i64>,
        /// Only samples checked at or before this Unix timestamp
        #[arg(long, value_name = "TIMESTAMP")]
        end: Option<i64>,
        #[command(flatten)]
        matches: MatchArgs,
    },
    /// Nagios-style health check over the usage history
    Check {
        /// Monitoring rules file
        #[arg(long, value_name = "FILE")]
        rules: Option<PathBuf>,
        /// Default warning threshold (fraction, percentage, or seat count)
        #[arg(long)]
        warn: Option<Threshold>,
        /// Default critical threshold (fraction, percentage, or seat count)
        #[arg(long)]
        crit: Option<Threshold>,
        /// Seconds before the newest sample counts as stale
        #[arg(long, value_name = "SECONDS")]
        max_data_age: Option<i64>,
    },
}

/// Feature filters shared by `ls` and `report`. A `{R}`, `{L}`, or `{G}`
/// prefix selects regex, LIKE, or glob matching; plain values must match
/// exactly.
#[derive(Debug, clap::Args)]
struct MatchArgs {
    #[arg(long, value_name = "PATTERN")]
    match_feature: Option<String>,
    #[arg(long, value_name = "PATTERN")]
    match_vendor: Option<String>,
    #[arg(long, value_name = "PATTERN")]
    match_version: Option<String>,
}

impl MatchArgs {
    fn apply(&self, predicate: &mut Option<Predicate>) {
        for (field, pattern) in [
            (Field::Feature, &self.match_feature),
            (Field::Vendor, &self.match_vendor),
            (Field::Version, &self.match_version),
        ] {
            if let Some(pattern) = pattern {
                let (op, value) = pattern_test(pattern);
                and_test(predicate, field, op, value);
            }
        }
    }
}

/// Split a match pattern into its operator prefix and value.
fn pattern_test(pattern: &str) -> (Operator, String) {
    let mut chars = pattern.chars();
    if let (Some('{'), Some(kind), Some('}')) = (chars.next(), chars.next(), chars.next()) {
        let rest: String = chars.collect();
        match kind.to_ascii_lowercase() {
            'r' => return (Operator::Regexp, rest),
            'l' => return (Operator::Like, rest),
            'g' => return (Operator::Glob, rest),
            _ => {}
        }
    }
    (Operator::Eq, pattern.to_string())
}

fn and_test(predicate: &mut Option<Predicate>, field: Field, op: Operator, value: impl Into<Value>) {
    match predicate {
        Some(existing) => existing.add_test(Combiner::And, field, op, value),
        None => *predicate = Some(Predicate::with_test(field, op, value)),
    }
}

fn main() {
    let cli = Cli::parse();
    let is_check = matches!(cli.command, Commands::Check { .. });
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            if is_check {
                // Monitoring systems read stdout; failures are UNKNOWN.
                println!("UNKNOWN: {err:#}");
                3
            } else {
                eprintln!("error: {err:#}");
                1
            }
        }
    };
    process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(database) = cli.database {
        config.database.path = Some(database);
    }

    // The check's service line must stay the only stdout/stderr output
    // unless verbosity is asked for explicitly.
    let quiet = cli.quiet || (matches!(cli.command, Commands::Check { .. }) && cli.verbose == 0);
    let level = if cli.verbose > 0 || quiet {
        logging::level_for(cli.verbose, quiet).to_string()
    } else {
        config.logging.level.clone()
    };
    let log_file = cli.log_file.or_else(|| config.logging.file.clone());
    let _log_guard = logging::init(&level, log_file.as_deref())?;

    match cli.command {
        Commands::Update {
            license_file,
            lmstat_file,
            lmstat_command,
            rrd_dir,
        } => {
            if let Some(path) = license_file {
                config.scan.license_file = Some(path);
            }
            if let Some(path) = lmstat_file {
                config.scan.lmstat_file = Some(path);
            }
            if let Some(command) = lmstat_command {
                config.scan.lmstat_command = Some(command);
            }
            if let Some(dir) = rrd_dir {
                config.rrd.directory = Some(dir);
            }
            run_update(&config)
        }
        Commands::Ls {
            id,
            name_only,
            matches,
        } => run_ls(&config, id, name_only, &matches),
        Commands::Report {
            aggregate,
            range,
            format,
            no_headers,
            show_id,
            no_counts,
            no_percent,
            no_expiration,
            no_checked,
            start,
            end,
            matches,
        } => {
            let aggregate = match aggregate {
                Some(aggregate) => aggregate,
                None => parse_setting(&config.report.aggregate, "report.aggregate")?,
            };
            let range = match range {
                Some(range) => range,
                None => parse_setting(&config.report.range, "report.range")?,
            };
            let options = RenderOptions {
                format: match format {
                    Some(format) => format,
                    None => parse_setting(&config.report.format, "report.format")?,
                },
                no_headers,
                fields: FieldSelection {
                    id: show_id,
                    counts: !no_counts,
                    percent: !no_percent,
                    expiration: !no_expiration,
                    checked: !no_checked,
                },
            };
            run_report(&config, aggregate, range, options, start, end, &matches)
        }
        Commands::Check {
            rules,
            warn,
            crit,
            max_data_age,
        } => run_check(&config, rules, warn, crit, max_data_age),
    }
}

fn parse_setting<T>(value: &str, name: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid {name} '{value}' in config: {err}"))
}

fn open_database(config: &Config, read_only: bool) -> Result<LicenseDb> {
    match &config.database.path {
        Some(path) if read_only => LicenseDb::open_read_only(path),
        Some(path) => LicenseDb::open(path),
        None => bail!("no database configured (set database.path or pass --database)"),
    }
}

fn run_update(config: &Config) -> Result<i32> {
    // Without a database the scan still runs against a throwaway store, so
    // parse problems surface even before any persistence is set up.
    let mut db = match &config.database.path {
        Some(path) => LicenseDb::open(path)?,
        None => LicenseDb::open_in_memory()?,
    };
    if let Some(directory) = &config.rrd.directory {
        let repository = RrdRepository::new(directory, &config.rrd.rrdtool)?;
        db.set_rrd_repository(Some(repository));
    }

    let outcome = ingest::run_update(
        &mut db,
        config.scan.license_file.as_deref(),
        config.lmstat_source().as_ref(),
        None,
    )?;
    if !outcome.is_complete() {
        eprintln!(
            "failed to commit {} of {} features",
            outcome.failed.len(),
            outcome.committed + outcome.failed.len()
        );
        return Ok(1);
    }
    Ok(0)
}

fn run_ls(config: &Config, id: Option<i64>, name_only: bool, matches: &MatchArgs) -> Result<i32> {
    let db = open_database(config, true)?;

    let mut predicate = None;
    if let Some(id) = id {
        and_test(&mut predicate, Field::FeatureId, Operator::Eq, id);
    }
    matches.apply(&mut predicate);

    let features = db.lookup_features(predicate.as_ref())?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for feature in &features {
        if name_only {
            writeln!(out, "{}", feature.feature())?;
        } else {
            writeln!(
                out,
                "{} {} ({} {})",
                feature.id().unwrap_or_default(),
                feature.feature(),
                feature.vendor(),
                feature.version()
            )?;
        }
    }
    Ok(0)
}

#[allow(clippy::too_many_arguments)]
fn run_report(
    config: &Config,
    aggregate: Aggregate,
    range: RangeFilter,
    options: RenderOptions,
    start: Option<i64>,
    end: Option<i64>,
    matches: &MatchArgs,
) -> Result<i32> {
    let db = open_database(config, true)?;

    let mut predicate = None;
    matches.apply(&mut predicate);

    // An explicit checked-time window replaces the range filter; a missing
    // endpoint is inferred from the range's span when it has one.
    let range = if start.is_some() || end.is_some() {
        let span = range.span_seconds();
        let start = start.or_else(|| match (end, span) {
            (Some(end), Some(span)) => Some(end - span),
            _ => None,
        });
        let end = end.or_else(|| match (start, span) {
            (Some(start), Some(span)) => Some(start + span),
            _ => None,
        });
        if let Some(start) = start {
            and_test(&mut predicate, Field::Checked, Operator::Ge, start);
        }
        if let Some(end) = end {
            and_test(&mut predicate, Field::Checked, Operator::Le, end);
        }
        RangeFilter::None
    } else {
        range
    };

    let mut report = db.usage_report(aggregate, range, predicate.as_ref())?;
    let rows = report.rows()?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    display::render(&mut out, &rows, aggregate, &options)?;
    Ok(0)
}

fn run_check(
    config: &Config,
    rules: Option<PathBuf>,
    warn: Option<Threshold>,
    crit: Option<Threshold>,
    max_data_age: Option<i64>,
) -> Result<i32> {
    let rules = match rules.as_deref().or(config.check.rules_file.as_deref()) {
        Some(path) => Some(RuleSet::load(path).context("failed to load monitoring rules")?),
        None => None,
    };
    let settings = CheckSettings {
        warn: warn.unwrap_or(Threshold::Fraction(config.check.warn)),
        crit: crit.unwrap_or(Threshold::Fraction(config.check.crit)),
        maximum_data_age: max_data_age.unwrap_or(config.check.maximum_data_age),
        rules,
    };

    let db = open_database(config, true)?;
    let output = check::run_check(&db, &settings, chrono::Utc::now().timestamp())?;
    println!("{}", output.line());
    Ok(output.status.exit_code())
}
