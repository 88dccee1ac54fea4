//! SQLite-backed storage for license usage history.
//!
//! [`LicenseDb`] wraps a single SQLite database holding two tables: `features`,
//! one row per licensed feature, and `counts`, an append-only log of seat usage
//! samples. Features loaded or created through the database are cached in an
//! in-memory [`FeatureSet`] so repeated lookups during a scan hit the cache
//! instead of the disk.
//!
//! Samples are written by [`LicenseDb::commit_counts`], which appends one
//! `counts` row for every cached feature whose counters were touched since it
//! was loaded. When an RRD repository is attached, each committed sample is
//! also mirrored into a per-feature round-robin archive for graphing.
//!
//! A `REGEXP` SQL function backed by the `regex` crate is registered on every
//! connection so predicates can use the `Regexp` operator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::models::{Feature, FeatureSet};
use crate::predicate::Predicate;
use crate::report::{Aggregate, RangeFilter, UsageReport};
use crate::rrd::{RrdRepository, RrdSample};

const DB_SCHEMA: &str = "\
CREATE TABLE features (
  feature_id            INTEGER PRIMARY KEY NOT NULL,
  feature_string        TEXT,
  vendor                TEXT,
  version               TEXT
);
CREATE UNIQUE INDEX unique_features_idx
  ON features(vendor, version, feature_string);
CREATE TABLE counts (
  feature_id            INTEGER NOT NULL REFERENCES features(feature_id)
                        ON DELETE CASCADE,
  issued                INTEGER NOT NULL DEFAULT 0,
  in_use                INTEGER NOT NULL DEFAULT 0,
  expiration_timestamp  BIGINT,
  checked_timestamp     BIGINT NOT NULL
);
";

const GET_FEATURES: &str = "SELECT feature_id, feature_string, vendor, version FROM features \
     ORDER BY feature_string, vendor, version";
const GET_FEATURE_BY_NAME: &str = "SELECT feature_id, feature_string, vendor, version FROM features \
     WHERE feature_string = ?1 AND vendor = ?2 AND version = ?3";
const GET_FEATURE_BY_ID: &str = "SELECT feature_id, feature_string, vendor, version FROM features \
     WHERE feature_id = ?1";
const ADD_FEATURE: &str = "INSERT INTO features (feature_string, vendor, version) VALUES (?1, ?2, ?3)";
const ADD_FEATURE_COUNT: &str = "INSERT INTO counts \
     (feature_id, in_use, issued, expiration_timestamp, checked_timestamp) \
     VALUES (?1, ?2, ?3, ?4, ?5)";
const GET_ALL_FEATURE_COUNTS: &str = "SELECT issued, in_use, checked_timestamp FROM counts \
     WHERE feature_id = ? ORDER BY checked_timestamp ASC";
const LOOKUP_FEATURES: &str = "SELECT feature_id, f.feature_string, f.vendor, f.version FROM features AS f";
const LOOKUP_FEATURES_ORDER: &str = " ORDER BY f.vendor, f.version, f.feature_string";

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result of a [`LicenseDb::commit_counts`] pass.
///
/// A commit keeps going after individual insert failures so one bad feature
/// cannot lose the samples of every other feature in the same scan.
#[derive(Debug, Default)]
pub struct CommitOutcome {
    /// Number of sample rows appended.
    pub committed: usize,
    /// Tuple strings of features whose sample could not be written.
    pub failed: Vec<String>,
}

impl CommitOutcome {
    /// True when every modified feature was committed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A license usage database plus its in-memory feature cache.
pub struct LicenseDb {
    conn: Connection,
    path: Option<PathBuf>,
    read_only: bool,
    features: FeatureSet,
    rrd: Option<RrdRepository>,
}

impl LicenseDb {
    /// Open the database at `path`, creating file and schema when absent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_at(path.as_ref(), false)
    }

    /// Open an existing database without write access.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_at(path.as_ref(), true)
    }

    /// Open a throwaway in-memory database with a fresh schema.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::prepare(conn, None, false, true)
    }

    fn open_at(path: &Path, read_only: bool) -> Result<Self> {
        let is_new = match std::fs::metadata(path) {
            Ok(meta) => {
                if !meta.is_file() {
                    bail!("database path {} exists but is not a regular file", path.display());
                }
                false
            }
            Err(_) => true,
        };
        if is_new && read_only {
            bail!(
                "cannot open nonexistent database {} read-only",
                path.display()
            );
        }
        let flags = if read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        };
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("failed to open license database {}", path.display()))?;
        Self::prepare(conn, Some(path.to_path_buf()), read_only, is_new)
    }

    fn prepare(conn: Connection, path: Option<PathBuf>, read_only: bool, is_new: bool) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)
            .context("failed to enable foreign key enforcement")?;
        register_regexp(&conn).context("failed to register the REGEXP SQL function")?;
        if is_new {
            conn.execute_batch(DB_SCHEMA)
                .context("failed to initialize database schema")?;
            debug!(path = ?path, "created license database schema");
        }
        Ok(Self {
            conn,
            path,
            read_only,
            features: FeatureSet::new(),
            rrd: None,
        })
    }

    /// The SQL schema used to initialize new databases.
    pub fn schema() -> &'static str {
        DB_SCHEMA
    }

    /// Filesystem path of the database, if it is file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Features loaded or created so far.
    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    /// Attach (or detach) the RRD repository mirrored on commit.
    pub fn set_rrd_repository(&mut self, rrd: Option<RrdRepository>) {
        self.rrd = rrd;
    }

    pub fn rrd_repository(&self) -> Option<&RrdRepository> {
        self.rrd.as_ref()
    }

    /// Pull every feature row into the in-memory set.
    pub fn load_all_features(&mut self) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare(GET_FEATURES)
            .context("failed to prepare feature listing")?;
        let rows = stmt
            .query_map([], row_to_feature)
            .context("feature listing query failed")?;
        for row in rows {
            let feature = row.context("failed to read feature row")?;
            match feature.id() {
                Some(id) if self.features.get_by_id(id).is_some() => continue,
                _ => {
                    self.features.add(feature);
                }
            }
        }
        Ok(())
    }

    /// Look up a feature by its (feature, vendor, version) natural key,
    /// registering it in the database when absent.
    ///
    /// The in-memory set is consulted first. A read-only database can only
    /// return features that already exist.
    pub fn feature_by_name(
        &mut self,
        feature: &str,
        vendor: &str,
        version: &str,
    ) -> Result<&mut Feature> {
        if let Some(index) = self
            .features
            .position_by_name(Some(feature), Some(vendor), Some(version))
        {
            return self
                .features
                .get_mut(index)
                .ok_or_else(|| anyhow!("feature cache index out of range"));
        }

        let loaded = self
            .conn
            .query_row(GET_FEATURE_BY_NAME, params![feature, vendor, version], row_to_feature)
            .optional()
            .with_context(|| format!("failed to look up feature {feature} ({vendor} v{version})"))?;

        if let Some(found) = loaded {
            debug!(feature, vendor, version, id = ?found.id(), "feature found in database");
            self.features.add(found);
        } else {
            if self.read_only {
                bail!("feature {feature} ({vendor} v{version}) is not in the read-only database");
            }
            self.conn
                .execute(ADD_FEATURE, params![feature, vendor, version])
                .with_context(|| format!("failed to register feature {feature} ({vendor} v{version})"))?;
            let id = self.conn.last_insert_rowid();
            debug!(feature, vendor, version, id, "registered new feature");
            self.features
                .add(Feature::with_stats(Some(id), feature, vendor, version, None, 0, 0));
        }
        self.features
            .get_by_name_mut(Some(feature), Some(vendor), Some(version))
            .ok_or_else(|| anyhow!("feature set rejected {feature} ({vendor} v{version})"))
    }

    /// Look up a feature by its database id. Unknown ids yield `None`.
    pub fn feature_by_id(&mut self, feature_id: i64) -> Result<Option<&mut Feature>> {
        if self.features.get_by_id(feature_id).is_some() {
            return Ok(self.features.get_by_id_mut(feature_id));
        }
        let loaded = self
            .conn
            .query_row(GET_FEATURE_BY_ID, [feature_id], row_to_feature)
            .optional()
            .with_context(|| format!("failed to look up feature id {feature_id}"))?;
        match loaded {
            Some(found) => {
                if !self.features.add(found) {
                    bail!("feature set rejected feature id {feature_id}");
                }
                Ok(self.features.get_by_id_mut(feature_id))
            }
            None => Ok(None),
        }
    }

    /// Fold a detached feature observation into the database.
    ///
    /// The observation must not carry a database id and must not already be
    /// in the in-memory set. Its counters are copied onto the database-backed
    /// feature only when they were actually touched.
    pub fn add_feature(&mut self, observed: Feature) -> Result<&mut Feature> {
        if observed.id().is_some() {
            bail!(
                "cannot add feature {} that already has a database id",
                observed.tuple_string()
            );
        }
        if self
            .features
            .get_by_name(Some(observed.feature()), Some(observed.vendor()), Some(observed.version()))
            .is_some()
        {
            bail!("feature {} is already registered", observed.tuple_string());
        }
        let backed = self.feature_by_name(observed.feature(), observed.vendor(), observed.version())?;
        if observed.is_modified() {
            backed.set_expiration(observed.expiration());
            backed.set_in_use(observed.in_use());
            backed.set_issued(observed.issued());
        }
        Ok(backed)
    }

    /// Fetch the features matching `predicate` as a detached set.
    ///
    /// The returned features are snapshots; they are not added to the
    /// database's own cache.
    pub fn lookup_features(&self, predicate: Option<&Predicate>) -> Result<FeatureSet> {
        let (sql, params) = match predicate {
            Some(predicate) => {
                let (clause, params) = predicate.to_sql();
                (
                    format!("{LOOKUP_FEATURES} WHERE {clause}{LOOKUP_FEATURES_ORDER}"),
                    params,
                )
            }
            None => (format!("{LOOKUP_FEATURES}{LOOKUP_FEATURES_ORDER}"), Vec::new()),
        };
        debug!(query = %sql, "feature lookup");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("failed to prepare feature lookup: {sql}"))?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), row_to_feature)
            .context("feature lookup query failed")?;
        let mut found = FeatureSet::new();
        for row in rows {
            found.add(row.context("failed to read feature row")?);
        }
        Ok(found)
    }

    /// Append one usage sample for every modified feature in the set.
    ///
    /// `check_timestamp` defaults to the current time. Features whose sample
    /// fails to insert are reported in the outcome rather than aborting the
    /// pass.
    pub fn commit_counts(&self, check_timestamp: Option<i64>) -> Result<CommitOutcome> {
        if self.read_only {
            bail!("cannot commit counts to a read-only database");
        }
        let when = check_timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());
        let mut outcome = CommitOutcome::default();
        for feature in self.features.iter() {
            if !feature.is_modified() {
                continue;
            }
            match commit_feature_count(&self.conn, self.rrd.as_ref(), feature, when) {
                Ok(()) => outcome.committed += 1,
                Err(err) => {
                    warn!(
                        feature = %feature.tuple_string(),
                        error = %format!("{err:#}"),
                        "failed to commit usage sample"
                    );
                    outcome.failed.push(feature.tuple_string());
                }
            }
        }
        Ok(outcome)
    }

    /// Run a usage report over the `counts` table.
    pub fn usage_report(
        &self,
        aggregate: Aggregate,
        range: RangeFilter,
        predicate: Option<&Predicate>,
    ) -> Result<UsageReport<'_>> {
        UsageReport::new(&self.conn, aggregate, range, predicate)
    }
}

fn commit_feature_count(
    conn: &Connection,
    rrd: Option<&RrdRepository>,
    feature: &Feature,
    when: i64,
) -> Result<()> {
    let feature_id = feature
        .id()
        .ok_or_else(|| anyhow!("feature {} has no database id", feature.tuple_string()))?;
    conn.execute(
        ADD_FEATURE_COUNT,
        params![feature_id, feature.in_use(), feature.issued(), feature.expiration(), when],
    )
    .with_context(|| format!("failed to insert usage sample for {}", feature.tuple_string()))?;

    // Archive failures must not lose the sample that already landed in SQLite.
    if let Some(rrd) = rrd {
        if let Err(err) = mirror_to_rrd(conn, rrd, feature, feature_id, when) {
            warn!(
                feature = %feature.tuple_string(),
                error = %format!("{err:#}"),
                "failed to mirror usage sample into RRD archive"
            );
        }
    }
    Ok(())
}

/// Bring the feature's RRD archive up to date with the sample just committed.
///
/// A missing archive is created and seeded from the feature's full sample
/// history, which already includes the new row. An existing archive gets a
/// single-point update.
fn mirror_to_rrd(
    conn: &Connection,
    rrd: &RrdRepository,
    feature: &Feature,
    feature_id: i64,
    when: i64,
) -> Result<()> {
    if rrd.exists(feature_id) {
        rrd.record(feature_id, when, feature.in_use())
    } else {
        let mut stmt = conn
            .prepare(GET_ALL_FEATURE_COUNTS)
            .context("failed to prepare sample history query")?;
        let samples = stmt
            .query_map([feature_id], |row| {
                Ok(RrdSample {
                    issued: row.get(0)?,
                    in_use: row.get(1)?,
                    timestamp: row.get(2)?,
                })
            })
            .context("sample history query failed")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read sample history")?;
        rrd.create_seeded(feature_id, feature.feature(), &samples)
    }
}

fn row_to_feature(row: &Row<'_>) -> rusqlite::Result<Feature> {
    Ok(Feature::with_stats(
        Some(row.get(0)?),
        row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        None,
        0,
        0,
    ))
}

/// Register a `REGEXP` function so `expr REGEXP pattern` works in predicates.
///
/// NULL arguments never match. The compiled regex is cached on the statement
/// via SQLite auxdata, so a query reuses one compilation across rows.
fn register_regexp(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            if matches!(ctx.get_raw(0), ValueRef::Null) || matches!(ctx.get_raw(1), ValueRef::Null) {
                return Ok(false);
            }
            let regex: Arc<Regex> = ctx.get_or_create_aux(0, |vr| -> Result<_, BoxError> {
                Ok(Regex::new(vr.as_str()?)?)
            })?;
            let text = ctx
                .get_raw(1)
                .as_str()
                .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
            Ok(regex.is_match(text))
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::{Field, Operator};

    fn count_rows(db: &LicenseDb, sql: &str) -> i64 {
        db.conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn test_feature_by_name_creates_then_caches() {
        let mut db = LicenseDb::open_in_memory().unwrap();
        let id = {
            let feature = db.feature_by_name("glide", "acme", "2024.06").unwrap();
            feature.id()
        };
        assert!(id.is_some());

        // Second lookup must hit the cache and keep the same id.
        let feature = db.feature_by_name("glide", "acme", "2024.06").unwrap();
        assert_eq!(feature.id(), id);
        assert_eq!(db.features().len(), 1);
        assert_eq!(count_rows(&db, "SELECT COUNT(*) FROM features"), 1);
    }

    #[test]
    fn test_commit_skips_unmodified_features() {
        let mut db = LicenseDb::open_in_memory().unwrap();
        db.feature_by_name("idle", "acme", "1.0").unwrap();
        db.feature_by_name("busy", "acme", "1.0").unwrap().add_in_use(4);

        let outcome = db.commit_counts(Some(1_700_000_000)).unwrap();
        assert_eq!(outcome.committed, 1);
        assert!(outcome.is_complete());
        assert_eq!(count_rows(&db, "SELECT COUNT(*) FROM counts"), 1);
    }

    #[test]
    fn test_zero_usage_sample_is_committed() {
        let mut db = LicenseDb::open_in_memory().unwrap();
        db.feature_by_name("quiet", "acme", "1.0").unwrap().add_in_use(0);

        let outcome = db.commit_counts(Some(1_700_000_000)).unwrap();
        assert_eq!(outcome.committed, 1);
        let in_use: i64 = db
            .conn
            .query_row("SELECT in_use FROM counts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(in_use, 0);
    }

    #[test]
    fn test_permanent_expiration_stored_as_null() {
        let mut db = LicenseDb::open_in_memory().unwrap();
        {
            let feature = db.feature_by_name("perm", "acme", "1.0").unwrap();
            feature.set_in_use(1);
        }
        {
            let feature = db.feature_by_name("dated", "acme", "1.0").unwrap();
            feature.set_in_use(1);
            feature.set_expiration(Some(1_750_000_000));
        }
        db.commit_counts(Some(1_700_000_000)).unwrap();

        let nulls = count_rows(&db, "SELECT COUNT(*) FROM counts WHERE expiration_timestamp IS NULL");
        let dated = count_rows(&db, "SELECT COUNT(*) FROM counts WHERE expiration_timestamp = 1750000000");
        assert_eq!(nulls, 1);
        assert_eq!(dated, 1);
    }

    #[test]
    fn test_lookup_features_with_regexp_predicate() {
        let mut db = LicenseDb::open_in_memory().unwrap();
        db.feature_by_name("glide", "acme", "1.0").unwrap();
        db.feature_by_name("glow", "acme", "1.0").unwrap();
        db.feature_by_name("torch", "acme", "1.0").unwrap();

        let predicate = Predicate::with_test(Field::Feature, Operator::Regexp, "^gl");
        let found = db.lookup_features(Some(&predicate)).unwrap();
        let names: Vec<&str> = found.iter().map(|f| f.feature()).collect();
        assert_eq!(names, vec!["glide", "glow"]);
    }

    #[test]
    fn test_lookup_binds_values_instead_of_splicing() {
        let mut db = LicenseDb::open_in_memory().unwrap();
        db.feature_by_name("glide", "acme", "1.0").unwrap();

        // A hostile value must be treated as data, not as SQL.
        let predicate = Predicate::with_test(Field::Feature, Operator::Eq, "x' OR '1'='1");
        let found = db.lookup_features(Some(&predicate)).unwrap();
        assert!(found.is_empty());
        assert_eq!(count_rows(&db, "SELECT COUNT(*) FROM features"), 1);
    }

    #[test]
    fn test_add_feature_folds_modified_counters() {
        let mut db = LicenseDb::open_in_memory().unwrap();

        let mut observed = Feature::new("glide", "acme", "1.0");
        observed.set_issued(20);
        observed.set_in_use(7);
        let backed = db.add_feature(observed).unwrap();
        assert_eq!(backed.issued(), 20);
        assert_eq!(backed.in_use(), 7);
        assert!(backed.is_modified());

        // An untouched observation must not overwrite the counters.
        let result = db.add_feature(Feature::new("glide", "acme", "1.0"));
        assert!(result.is_err());
    }

    #[test]
    fn test_read_only_rejects_missing_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.db");
        assert!(LicenseDb::open_read_only(&path).is_err());
    }

    #[test]
    fn test_read_only_rejects_commit_and_new_features() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.db");
        {
            let mut db = LicenseDb::open(&path).unwrap();
            db.feature_by_name("glide", "acme", "1.0").unwrap().add_in_use(2);
            db.commit_counts(Some(1_700_000_000)).unwrap();
        }

        let mut db = LicenseDb::open_read_only(&path).unwrap();
        assert!(db.is_read_only());
        db.feature_by_name("glide", "acme", "1.0").unwrap();
        assert!(db.feature_by_name("other", "acme", "1.0").is_err());
        assert!(db.commit_counts(None).is_err());
    }

    #[test]
    fn test_reopen_loads_persisted_features() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.db");
        {
            let mut db = LicenseDb::open(&path).unwrap();
            db.feature_by_name("glide", "acme", "1.0").unwrap();
            db.feature_by_name("torch", "zenith", "2.0").unwrap();
        }

        let mut db = LicenseDb::open(&path).unwrap();
        assert!(db.features().is_empty());
        db.load_all_features().unwrap();
        assert_eq!(db.features().len(), 2);
        let feature = db.feature_by_id(1).unwrap();
        assert!(feature.is_some());
        assert!(db.feature_by_id(999).unwrap().is_none());
    }
}
