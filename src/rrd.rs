//! Round-robin archives mirrored from committed samples.
//!
//! When an archive directory is configured, every committed usage sample is
//! also fed to `rrdtool` so per-feature graphs can be rendered without
//! touching SQLite. Each feature owns one `<feature_id>.rrd` file inside the
//! repository directory. A missing archive is created on first commit and
//! back-filled from the feature's full sample history.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

/// Sample interval the archives are built around, in seconds.
const RRD_STEP: u32 = 300;

/// How many history points are replayed per `rrdtool update` invocation.
const UPDATE_BATCH: usize = 12;

/// Retention ladder: 18 days at 5 minutes, 60 days at 1 hour, 180 days at
/// 12 hours, 1080 days at 24 hours, 14 years at 7 days.
const ARCHIVES: [&str; 5] = [
    "RRA:AVERAGE:0.5:1:5184",
    "RRA:AVERAGE:0.5:12:1440",
    "RRA:AVERAGE:0.5:144:1800",
    "RRA:AVERAGE:0.5:288:1080",
    "RRA:AVERAGE:0.5:2016:730",
];

/// One usage sample replayed into a freshly created archive.
#[derive(Debug, Clone, Copy)]
pub struct RrdSample {
    pub issued: i64,
    pub in_use: i64,
    pub timestamp: i64,
}

/// A directory of per-feature RRD archives, maintained through `rrdtool`.
pub struct RrdRepository {
    directory: PathBuf,
    rrdtool: PathBuf,
}

impl RrdRepository {
    /// Wrap an archive directory. The directory must already exist.
    pub fn new(directory: impl Into<PathBuf>, rrdtool: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        if !directory.is_dir() {
            bail!(
                "RRD repository directory {} does not exist",
                directory.display()
            );
        }
        Ok(Self {
            directory,
            rrdtool: rrdtool.into(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the archive belonging to `feature_id`.
    pub fn archive_path(&self, feature_id: i64) -> PathBuf {
        self.directory.join(format!("{feature_id}.rrd"))
    }

    pub fn exists(&self, feature_id: i64) -> bool {
        self.archive_path(feature_id).is_file()
    }

    /// Append one sample to an existing archive.
    pub fn record(&self, feature_id: i64, timestamp: i64, in_use: i64) -> Result<()> {
        let path = self.archive_path(feature_id);
        self.run_update(&path, &[format!("{timestamp}:{in_use}")])
    }

    /// Create the archive for `feature_id` and replay its sample history.
    ///
    /// The archive origin sits one second before the first historical sample
    /// (rrdtool rejects points at or before the origin) or at the current
    /// time when there is no history yet. The seat ceiling of the data source
    /// comes from the first sample's issued count; without a positive count
    /// the ceiling stays unknown, since a literal 0 would clamp every later
    /// point.
    pub fn create_seeded(
        &self,
        feature_id: i64,
        feature: &str,
        samples: &[RrdSample],
    ) -> Result<()> {
        let path = self.archive_path(feature_id);
        let (start, ceiling) = match samples.first() {
            Some(first) if first.issued > 0 => (first.timestamp - 1, first.issued.to_string()),
            Some(first) => (first.timestamp - 1, "U".to_string()),
            None => (chrono::Utc::now().timestamp(), "U".to_string()),
        };

        let mut command = Command::new(&self.rrdtool);
        command
            .arg("create")
            .arg(&path)
            .arg("--start")
            .arg(start.to_string())
            .arg("--step")
            .arg(RRD_STEP.to_string())
            .arg(format!("DS:in_use:GAUGE:600:0:{ceiling}"))
            .args(ARCHIVES);
        run_rrdtool(&mut command).with_context(|| {
            format!("failed to create RRD archive for feature '{feature}' (id={feature_id})")
        })?;
        debug!(feature, feature_id, path = %path.display(), "created RRD archive");

        for batch in samples.chunks(UPDATE_BATCH) {
            let points: Vec<String> = batch
                .iter()
                .map(|sample| format!("{}:{}", sample.timestamp, sample.in_use))
                .collect();
            // A replay failure leaves a gap in the graph; the SQLite history
            // is still intact, so keep going.
            if let Err(err) = self.run_update(&path, &points) {
                warn!(
                    feature_id,
                    error = %format!("{err:#}"),
                    "failed to replay samples into RRD archive"
                );
            }
        }
        Ok(())
    }

    fn run_update(&self, path: &Path, points: &[String]) -> Result<()> {
        let mut command = Command::new(&self.rrdtool);
        command.arg("update").arg(path).args(points);
        run_rrdtool(&mut command)
            .with_context(|| format!("failed to update RRD archive {}", path.display()))
    }
}

fn run_rrdtool(command: &mut Command) -> Result<()> {
    let output = command.output().context("failed to run rrdtool")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("rrdtool exited with {}: {}", output.status, stderr.trim());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stand-in rrdtool that appends its arguments to `calls.log`.
    #[cfg(unix)]
    fn recording_tool(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let tool = dir.join("record-args.sh");
        std::fs::write(&tool, "#!/bin/sh\necho \"$@\" >> \"$(dirname \"$0\")/calls.log\"\n")
            .unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        tool
    }

    #[cfg(unix)]
    #[test]
    fn test_create_seeded_takes_ceiling_from_first_issued_count() {
        let dir = tempfile::tempdir().unwrap();
        let repo = RrdRepository::new(dir.path(), recording_tool(dir.path())).unwrap();

        let samples = [RrdSample {
            issued: 10,
            in_use: 3,
            timestamp: 1_700_000_000,
        }];
        repo.create_seeded(1, "glide", &samples).unwrap();

        let log = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert!(log.contains("DS:in_use:GAUGE:600:0:10"), "{log}");
        assert!(log.contains("--start 1699999999"), "{log}");
    }

    #[cfg(unix)]
    #[test]
    fn test_create_seeded_without_positive_issued_leaves_ceiling_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let repo = RrdRepository::new(dir.path(), recording_tool(dir.path())).unwrap();

        // A zero ceiling would clamp every later point to unknown.
        let samples = [RrdSample {
            issued: 0,
            in_use: 0,
            timestamp: 1_700_000_000,
        }];
        repo.create_seeded(2, "unresolved", &samples).unwrap();

        let log = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert!(log.contains("DS:in_use:GAUGE:600:0:U"), "{log}");
    }

    #[test]
    fn test_new_requires_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RrdRepository::new(dir.path(), "rrdtool").is_ok());
        assert!(RrdRepository::new(dir.path().join("missing"), "rrdtool").is_err());
    }

    #[test]
    fn test_archive_paths_are_keyed_by_feature_id() {
        let dir = tempfile::tempdir().unwrap();
        let repo = RrdRepository::new(dir.path(), "rrdtool").unwrap();
        assert_eq!(repo.archive_path(42), dir.path().join("42.rrd"));
        assert!(!repo.exists(42));

        std::fs::write(dir.path().join("42.rrd"), b"").unwrap();
        assert!(repo.exists(42));
    }

    #[test]
    fn test_record_surfaces_tool_failures() {
        let dir = tempfile::tempdir().unwrap();

        // Stand-in binaries: exit status is all that matters here.
        let ok = RrdRepository::new(dir.path(), "true").unwrap();
        assert!(ok.record(1, 1_700_000_000, 3).is_ok());

        let failing = RrdRepository::new(dir.path(), "false").unwrap();
        assert!(failing.record(1, 1_700_000_000, 3).is_err());
    }

    #[test]
    fn test_create_seeded_replays_history_in_batches() {
        let dir = tempfile::tempdir().unwrap();
        let repo = RrdRepository::new(dir.path(), "true").unwrap();

        let samples: Vec<RrdSample> = (0..25)
            .map(|i| RrdSample {
                issued: 10,
                in_use: i % 5,
                timestamp: 1_700_000_000 + i * 300,
            })
            .collect();
        assert!(repo.create_seeded(7, "glide", &samples).is_ok());
        assert!(repo.create_seeded(8, "empty", &[]).is_ok());
    }
}
