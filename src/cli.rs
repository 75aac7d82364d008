// ABOUTME: Command-line interface for the dump and restore subcommands
// ABOUTME: Turns parsed arguments into a normalized Config

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{Config, DumpOptions, JobWaitTimeout, RestoreOptions, DEFAULT_JOBS};

#[derive(Parser, Debug)]
#[command(name = "timescaledb-backup")]
#[command(about = "Back up and restore TimescaleDB databases with pg_dump and pg_restore", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Dump a database into a new dump directory
    Dump(DumpArgs),
    /// Restore a dump directory into a database
    Restore(RestoreArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// PostgreSQL URI, postgresql://[user[:password]@][host][:port][/dbname][?param=value&...]
    #[arg(long = "db-uri", env = "TSBACKUP_DB_URI", hide_env_values = true)]
    pub db_uri: String,

    /// Directory to place the dump in or to restore from
    #[arg(long = "dump-dir")]
    pub dump_dir: PathBuf,

    /// Number of parallel jobs, 0 disables parallelism
    #[arg(long, default_value_t = DEFAULT_JOBS)]
    pub jobs: u32,
}

impl ConnectionArgs {
    fn config(&self) -> Result<Config> {
        let mut config = Config::new(self.db_uri.clone(), &self.dump_dir)?;
        config.jobs = self.jobs;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct DumpArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Verbose output
    #[arg(long, default_value_t = false, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub verbose: bool,

    /// Dump roles with pg_dumpall into roles.sql
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub dump_roles: bool,

    /// Dump tablespaces with pg_dumpall into tablespaces.sql
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub dump_tablespaces: bool,

    /// Reschedule background jobs that perform DDL while a parallel dump runs
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub dump_pause_jobs: bool,

    /// Also reschedule user-defined actions (TimescaleDB 2.x)
    #[arg(long = "dump-pause-udas", default_value_t = true, action = ArgAction::Set)]
    pub dump_pause_udas: bool,

    /// Seconds to wait for running jobs to finish; 0 waits forever, negative does not wait
    #[arg(long, default_value_t = 600, allow_negative_numbers = true)]
    pub dump_job_finish_timeout: i64,
}

impl DumpArgs {
    pub fn into_config(self) -> Result<Config> {
        let mut config = self.connection.config()?;
        config.verbose = self.verbose;
        config.dump = DumpOptions {
            roles: self.dump_roles,
            tablespaces: self.dump_tablespaces,
            pause_jobs: self.dump_pause_jobs,
            pause_udas: self.dump_pause_udas,
            job_finish_timeout: JobWaitTimeout::from_secs(self.dump_job_finish_timeout),
            ..DumpOptions::default()
        };
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct RestoreArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Verbose output
    #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub verbose: bool,

    /// Update TimescaleDB to the default installed version after restoring
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub do_update: bool,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Extra options passed to every pg_restore run, e.g. -- --no-owner
    #[arg(last = true)]
    pub pg_restore_flags: Vec<String>,
}

impl RestoreArgs {
    pub fn into_config(self) -> Result<Config> {
        let mut config = self.connection.config()?;
        config.verbose = self.verbose;
        config.restore = RestoreOptions {
            do_update: self.do_update,
            pg_restore_flags: self.pg_restore_flags,
        };
        Ok(config)
    }
}
