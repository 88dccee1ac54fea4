//! Layered configuration.
//!
//! Settings come from four layers, each overriding the one before it:
//! built-in defaults, a TOML config file, environment variables, and CLI
//! flags (applied by the command front ends). The config file is either the
//! path given with `--config`, `~/.config/flexlm-usage/config.toml`, or
//! `/etc/flexlm-usage.toml`, whichever exists first.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::ingest::LmstatSource;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub database: DatabaseConfig,
    pub scan: ScanConfig,
    pub rrd: RrdConfig,
    pub check: CheckConfig,
    pub report: ReportConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQLite file holding features and usage counts. Unset means the tools
    /// run against a throwaway in-memory database.
    pub path: Option<PathBuf>,
}

/// Where the update scan reads from. The lmstat sources are tried in order:
/// a captured output file, then a shell command, then a directly run
/// program.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    pub license_file: Option<PathBuf>,
    pub lmstat_file: Option<PathBuf>,
    pub lmstat_command: Option<String>,
    pub lmstat_program: Option<String>,
    pub lmstat_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RrdConfig {
    /// Directory of per-feature RRD archives; unset disables the mirror.
    pub directory: Option<PathBuf>,
    /// The rrdtool binary to invoke.
    pub rrdtool: PathBuf,
}

impl Default for RrdConfig {
    fn default() -> Self {
        Self {
            directory: None,
            rrdtool: PathBuf::from("rrdtool"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckConfig {
    /// Default warning threshold as a fraction of issued seats.
    pub warn: f64,
    /// Default critical threshold as a fraction of issued seats.
    pub crit: f64,
    /// Seconds before the newest sample counts as stale.
    pub maximum_data_age: i64,
    pub rules_file: Option<PathBuf>,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            warn: 0.95,
            crit: 0.99,
            maximum_data_age: 3_600,
            rules_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportConfig {
    pub aggregate: String,
    pub range: String,
    pub format: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            aggregate: "total".to_string(),
            range: "day".to_string(),
            format: "column".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from file, environment, and defaults.
    ///
    /// An explicitly named file must exist; the well-known locations are
    /// optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let mut found = None;
                for path in Self::well_known_paths() {
                    if path.is_file() {
                        found = Some(Self::load_from_file(&path)?);
                        break;
                    }
                }
                found.unwrap_or_default()
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn well_known_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("flexlm-usage").join("config.toml"));
        }
        paths.push(PathBuf::from("/etc/flexlm-usage.toml"));
        paths
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        info!(config_file = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("FLEXLM_USAGE_DB") {
            self.database.path = Some(PathBuf::from(value));
        }
        if let Ok(value) = env::var("FLEXLM_USAGE_LICENSE_FILE") {
            self.scan.license_file = Some(PathBuf::from(value));
        }
        if let Ok(value) = env::var("FLEXLM_USAGE_LMSTAT_COMMAND") {
            self.scan.lmstat_command = Some(value);
        }
        if let Ok(value) = env::var("FLEXLM_USAGE_RRD_DIR") {
            self.rrd.directory = Some(PathBuf::from(value));
        }
        if let Ok(value) = env::var("LOG_LEVEL") {
            self.logging.level = value;
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("warn", self.check.warn), ("crit", self.check.crit)] {
            if !(0.0..=1.0).contains(&value) {
                bail!("check.{name} must be a fraction between 0 and 1, got {value}");
            }
        }
        if self.check.maximum_data_age <= 0 {
            bail!(
                "check.maximum_data_age must be positive, got {}",
                self.check.maximum_data_age
            );
        }
        Ok(())
    }

    /// The lmstat source the scan layers resolve to, if any is configured.
    pub fn lmstat_source(&self) -> Option<LmstatSource> {
        if let Some(path) = &self.scan.lmstat_file {
            return Some(LmstatSource::File(path.clone()));
        }
        if let Some(command) = &self.scan.lmstat_command {
            return Some(LmstatSource::Shell(command.clone()));
        }
        self.scan
            .lmstat_program
            .as_ref()
            .map(|program| LmstatSource::Exec(program.clone(), self.scan.lmstat_args.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.database.path, None);
        assert_eq!(config.check.warn, 0.95);
        assert_eq!(config.check.crit, 0.99);
        assert_eq!(config.check.maximum_data_age, 3_600);
        assert_eq!(config.report.aggregate, "total");
        assert_eq!(config.report.range, "day");
        assert_eq!(config.rrd.rrdtool, PathBuf::from("rrdtool"));
        assert!(config.lmstat_source().is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            "[database]\npath = \"/var/lib/flexlm-usage.db\"\n\n[check]\nwarn = 0.8\n",
        )
        .unwrap();
        assert_eq!(
            config.database.path,
            Some(PathBuf::from("/var/lib/flexlm-usage.db"))
        );
        assert_eq!(config.check.warn, 0.8);
        assert_eq!(config.check.crit, 0.99);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("[check]\nwran = 0.8\n").is_err());
    }

    #[test]
    fn test_env_override() {
        let mut config = Config::default();
        env::set_var("FLEXLM_USAGE_DB", "/tmp/env.db");
        config.apply_env_overrides();
        env::remove_var("FLEXLM_USAGE_DB");
        assert_eq!(config.database.path, Some(PathBuf::from("/tmp/env.db")));
    }

    #[test]
    fn test_validation_rejects_bad_thresholds() {
        let mut config = Config::default();
        config.check.crit = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.check.maximum_data_age = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lmstat_source_precedence() {
        let mut config = Config::default();
        config.scan.lmstat_program = Some("lmstat".to_string());
        config.scan.lmstat_args = vec!["-a".to_string()];
        assert_eq!(
            config.lmstat_source(),
            Some(LmstatSource::Exec(
                "lmstat".to_string(),
                vec!["-a".to_string()]
            ))
        );

        config.scan.lmstat_command = Some("lmstat -a -c /etc/license.dat".to_string());
        assert!(matches!(
            config.lmstat_source(),
            Some(LmstatSource::Shell(_))
        ));

        config.scan.lmstat_file = Some(PathBuf::from("/tmp/lmstat.out"));
        assert!(matches!(config.lmstat_source(), Some(LmstatSource::File(_))));
    }
}
