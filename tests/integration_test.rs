//! End-to-end library tests: scan, commit, report.

mod common;

use common::{write_fixture, LICENSE_FILE, LMSTAT_OUTPUT};
use flexlm_usage::ingest::{self, LmstatSource};
use flexlm_usage::predicate::{Field, Operator, Predicate};
use flexlm_usage::report::{Aggregate, IntRange, RangeFilter, TimeRange};
use flexlm_usage::store::LicenseDb;
use tempfile::TempDir;

#[test]
fn test_single_commit_reports_one_collapsed_row() {
    let mut db = LicenseDb::open_in_memory().unwrap();
    {
        let feature = db.feature_by_name("MATLAB", "MLM", "R2023a").unwrap();
        feature.set_issued(10);
        feature.set_in_use(7);
    }
    let outcome = db.commit_counts(Some(1_700_000_000)).unwrap();
    assert!(outcome.is_complete());

    let mut report = db
        .usage_report(Aggregate::None, RangeFilter::None, None)
        .unwrap();
    let rows = report.rows().unwrap();
    assert_eq!(rows.len(), 1);

    let row = &rows[0];
    assert_eq!(row.feature_id, 1);
    assert_eq!(row.in_use, IntRange { min: 7, max: 7, avg: 7 });
    assert_eq!(row.issued, IntRange { min: 10, max: 10, avg: 10 });
    assert_eq!(
        row.checked,
        TimeRange {
            start: 1_700_000_000,
            end: 1_700_000_000
        }
    );
}

#[test]
fn test_total_aggregate_over_two_commits() {
    let mut db = LicenseDb::open_in_memory().unwrap();
    {
        let feature = db.feature_by_name("MATLAB", "MLM", "R2023a").unwrap();
        feature.set_issued(10);
        feature.set_in_use(5);
    }
    db.commit_counts(Some(1_000)).unwrap();
    db.feature_by_name("MATLAB", "MLM", "R2023a")
        .unwrap()
        .set_in_use(9);
    db.commit_counts(Some(2_000)).unwrap();

    let mut report = db
        .usage_report(Aggregate::Total, RangeFilter::None, None)
        .unwrap();
    let rows = report.rows().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].in_use, IntRange { min: 5, max: 9, avg: 7 });
    assert_eq!(rows[0].issued.avg, 10);
    assert_eq!(rows[0].checked, TimeRange { start: 1_000, end: 2_000 });
}

#[test]
fn test_find_or_create_is_idempotent_across_reopens() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("usage.db");

    let first_id = {
        let mut db = LicenseDb::open(&path).unwrap();
        let id = db.feature_by_name("MATLAB", "MLM", "R2023a").unwrap().id();
        // Same tuple again resolves to the same feature.
        assert_eq!(db.feature_by_name("MATLAB", "MLM", "R2023a").unwrap().id(), id);
        id
    };

    let mut db = LicenseDb::open(&path).unwrap();
    let reopened_id = db.feature_by_name("MATLAB", "MLM", "R2023a").unwrap().id();
    assert_eq!(reopened_id, first_id);

    let all = db.lookup_features(None).unwrap();
    assert_eq!(all.len(), 1);
}

#[test]
fn test_update_pipeline_from_fixture_files() {
    let dir = TempDir::new().unwrap();
    let license = write_fixture(dir.path(), "license.dat", LICENSE_FILE);
    let lmstat = write_fixture(dir.path(), "lmstat.out", LMSTAT_OUTPUT);

    let mut db = LicenseDb::open(dir.path().join("usage.db")).unwrap();
    let outcome = ingest::run_update(
        &mut db,
        Some(&license),
        Some(&LmstatSource::File(lmstat)),
        Some(1_700_000_000),
    )
    .unwrap();
    assert_eq!(outcome.committed, 2);
    assert!(outcome.is_complete());

    let mut report = db
        .usage_report(Aggregate::None, RangeFilter::LastCheck, None)
        .unwrap();
    let rows = report.rows().unwrap();
    assert_eq!(rows.len(), 2);

    let matlab = rows.iter().find(|row| row.feature == "MATLAB").unwrap();
    assert_eq!(matlab.in_use.avg, 7);
    assert_eq!(matlab.issued.avg, 10);
    assert_eq!(matlab.expiration, None);
}

#[test]
fn test_last_hour_range_drops_old_samples() {
    let now = chrono::Utc::now().timestamp();
    let mut db = LicenseDb::open_in_memory().unwrap();
    db.feature_by_name("MATLAB", "MLM", "R2023a")
        .unwrap()
        .set_in_use(3);
    db.commit_counts(Some(now - 7_200)).unwrap();
    db.feature_by_name("MATLAB", "MLM", "R2023a")
        .unwrap()
        .set_in_use(5);
    db.commit_counts(Some(now - 1_800)).unwrap();

    // The month and year windows are fixed spans of seconds (30 and 365
    // days), so both samples fall inside them; the hour window keeps only
    // the newer one.
    let mut hour = db
        .usage_report(Aggregate::None, RangeFilter::LastHour, None)
        .unwrap();
    let rows = hour.rows().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].in_use.avg, 5);

    let mut month = db
        .usage_report(Aggregate::None, RangeFilter::LastMonth, None)
        .unwrap();
    assert_eq!(month.rows().unwrap().len(), 2);
}

#[test]
fn test_predicate_filters_report_rows() {
    let mut db = LicenseDb::open_in_memory().unwrap();
    for (feature, vendor) in [("MATLAB", "MLM"), ("ANSYS", "ansyslmd")] {
        let entry = db.feature_by_name(feature, vendor, "1.0").unwrap();
        entry.set_issued(10);
        entry.set_in_use(2);
    }
    db.commit_counts(Some(1_700_000_000)).unwrap();

    let mut pred = Predicate::with_test(Field::Vendor, Operator::Eq, "MLM");
    pred.add_test(
        flexlm_usage::predicate::Combiner::And,
        Field::InUse,
        Operator::Gt,
        0,
    );
    let mut report = db
        .usage_report(Aggregate::Total, RangeFilter::None, Some(&pred))
        .unwrap();
    let rows = report.rows().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].feature, "MATLAB");
}
