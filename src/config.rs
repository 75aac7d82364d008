// ABOUTME: Run configuration shared by dump and restore
// ABOUTME: Normalizes the dump directory and derives the dump and metadata paths

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::jobs::MoverSettings;

/// Subdirectory of the dump directory that holds the directory-format dump.
pub const PG_DUMP_SUBDIR: &str = "pgdump";
pub const INFO_FILE_NAME: &str = "timescaleVersionInfo.json";
pub const DEFAULT_JOBS: u32 = 4;

/// How long the dump waits for running background jobs to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobWaitTimeout {
    NoWait,
    Forever,
    After(Duration),
}

impl JobWaitTimeout {
    /// Negative seconds disable waiting, zero waits forever.
    pub fn from_secs(secs: i64) -> Self {
        match secs {
            s if s < 0 => JobWaitTimeout::NoWait,
            0 => JobWaitTimeout::Forever,
            s => JobWaitTimeout::After(Duration::from_secs(s as u64)),
        }
    }
}

impl Default for JobWaitTimeout {
    fn default() -> Self {
        JobWaitTimeout::After(Duration::from_secs(600))
    }
}

#[derive(Debug, Clone)]
pub struct DumpOptions {
    pub roles: bool,
    pub tablespaces: bool,
    pub pause_jobs: bool,
    /// Also pause user-defined actions (TimescaleDB 2.x only).
    pub pause_udas: bool,
    pub job_finish_timeout: JobWaitTimeout,
    pub mover: MoverSettings,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            roles: true,
            tablespaces: true,
            pause_jobs: true,
            pause_udas: true,
            job_finish_timeout: JobWaitTimeout::default(),
            mover: MoverSettings::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Update the extension to the default installed version after restoring.
    pub do_update: bool,
    /// Passed verbatim to every pg_restore pass.
    pub pg_restore_flags: Vec<String>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            do_update: true,
            pg_restore_flags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_uri: String,
    pub dump_dir: PathBuf,
    pub pg_dump_dir: PathBuf,
    pub info_file: PathBuf,
    /// Parallel workers for pg_dump/pg_restore; 0 disables parallelism.
    pub jobs: u32,
    pub verbose: bool,
    pub dump: DumpOptions,
    pub restore: RestoreOptions,
}

impl Config {
    pub fn new(db_uri: impl Into<String>, dump_dir: impl AsRef<Path>) -> Result<Self> {
        let dump_dir = absolute(dump_dir.as_ref())?;

        Ok(Self {
            db_uri: db_uri.into(),
            pg_dump_dir: dump_dir.join(PG_DUMP_SUBDIR),
            info_file: dump_dir.join(INFO_FILE_NAME),
            dump_dir,
            jobs: DEFAULT_JOBS,
            verbose: false,
            dump: DumpOptions::default(),
            restore: RestoreOptions::default(),
        })
    }

    pub fn is_parallel(&self) -> bool {
        self.jobs > 0
    }

    /// Name of the database the URI points at, if it names one.
    pub fn database_name(&self) -> Result<Option<String>> {
        let parsed: tokio_postgres::Config = self
            .db_uri
            .parse()
            .context("Invalid connection string")?;
        Ok(parsed.get_dbname().map(str::to_string))
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("Dump directory must not be empty");
    }
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to resolve current directory")?;
    Ok(cwd.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_paths() {
        let config = Config::new("postgresql://localhost/tsdb", "/var/backups/tsdb").unwrap();
        assert_eq!(config.dump_dir, PathBuf::from("/var/backups/tsdb"));
        assert_eq!(config.pg_dump_dir, PathBuf::from("/var/backups/tsdb/pgdump"));
        assert_eq!(
            config.info_file,
            PathBuf::from("/var/backups/tsdb/timescaleVersionInfo.json")
        );
    }

    #[test]
    fn test_relative_dump_dir_made_absolute() {
        let config = Config::new("postgresql://localhost/tsdb", "backup").unwrap();
        assert!(config.dump_dir.is_absolute());
        assert!(config.dump_dir.ends_with("backup"));
    }

    #[test]
    fn test_empty_dump_dir_rejected() {
        assert!(Config::new("postgresql://localhost/tsdb", "").is_err());
    }

    #[test]
    fn test_wait_timeout_from_secs() {
        assert_eq!(JobWaitTimeout::from_secs(-1), JobWaitTimeout::NoWait);
        assert_eq!(JobWaitTimeout::from_secs(0), JobWaitTimeout::Forever);
        assert_eq!(
            JobWaitTimeout::from_secs(90),
            JobWaitTimeout::After(Duration::from_secs(90))
        );
    }

    #[test]
    fn test_database_name() {
        let config = Config::new("postgresql://user@db.example.com:5432/metrics", "/tmp/x").unwrap();
        assert_eq!(config.database_name().unwrap().as_deref(), Some("metrics"));

        let config = Config::new("postgresql://user@db.example.com:5432", "/tmp/x").unwrap();
        assert_eq!(config.database_name().unwrap(), None);
    }
}
