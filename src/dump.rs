// ABOUTME: Dumps a TimescaleDB database with pg_dump in directory format
// ABOUTME: Records extension metadata and keeps background jobs out of the way of a parallel dump

use anyhow::{Context, Result};
use std::future::Future;
use std::path::{Path, PathBuf};

use crate::command::CommandRunner;
use crate::config::{Config, JobWaitTimeout};
use crate::extension;
use crate::info::TimescaleInfo;
use crate::jobs::JobMoverHandle;
use crate::tools::{LocatedTool, Tool};

/// Cluster-wide objects dumped with pg_dumpall next to the database dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalObjects {
    Roles,
    Tablespaces,
}

impl GlobalObjects {
    pub fn file_name(self) -> &'static str {
        match self {
            GlobalObjects::Roles => "roles.sql",
            GlobalObjects::Tablespaces => "tablespaces.sql",
        }
    }

    fn flag(self) -> &'static str {
        match self {
            GlobalObjects::Roles => "--roles-only",
            GlobalObjects::Tablespaces => "--tablespaces-only",
        }
    }

    fn label(self) -> &'static str {
        match self {
            GlobalObjects::Roles => "roles",
            GlobalObjects::Tablespaces => "tablespaces",
        }
    }
}

struct DumpTools {
    pg_dump: LocatedTool,
    pg_dumpall: Option<LocatedTool>,
}

pub async fn dump(config: &Config) -> Result<()> {
    let tools = locate_tools(config)?;
    tools.pg_dump.log_version().await?;

    let mover = (config.dump.pause_jobs && config.is_parallel()).then(|| {
        tracing::info!("Rescheduling background jobs that could deadlock the parallel dump");
        JobMoverHandle::spawn(
            &config.db_uri,
            config.dump.pause_udas,
            config.verbose,
            config.dump.mover,
        )
    });

    with_job_mover(
        mover,
        config.dump.job_finish_timeout,
        run_dump(config, &tools),
    )
    .await?;

    tracing::info!("Dump written to {}", config.dump_dir.display());
    Ok(())
}

/// Waits for running jobs, runs `work`, then stops the mover on every path.
async fn with_job_mover<F>(
    mut mover: Option<JobMoverHandle>,
    timeout: JobWaitTimeout,
    work: F,
) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let result = async {
        if let Some(mover) = mover.as_mut() {
            mover.wait_for_jobs_stopped(timeout).await?;
        }
        work.await
    }
    .await;

    // Schedules must be put back before returning, whatever happened above
    if let Some(mover) = mover {
        mover.stop().await;
    }
    result
}

fn locate_tools(config: &Config) -> Result<DumpTools> {
    let pg_dump = Tool::PgDump.locate()?;
    let pg_dumpall = if config.dump.roles || config.dump.tablespaces {
        Some(Tool::PgDumpAll.locate()?)
    } else {
        None
    };
    Ok(DumpTools {
        pg_dump,
        pg_dumpall,
    })
}

async fn run_dump(config: &Config, tools: &DumpTools) -> Result<()> {
    let state = extension::fetch_extension_state(&config.db_uri).await?;
    create_dump_dir(&config.dump_dir)?;
    TimescaleInfo::new(state)
        .write_to(&config.info_file)
        .context("Error with dump file creation")?;

    let runner = CommandRunner::new().with_timestamps(true);

    if let Some(pg_dumpall) = &tools.pg_dumpall {
        let database = config.database_name()?;
        let requested = [
            (config.dump.roles, GlobalObjects::Roles),
            (config.dump.tablespaces, GlobalObjects::Tablespaces),
        ];
        for (_, objects) in requested.into_iter().filter(|(wanted, _)| *wanted) {
            tracing::info!("Dumping {}", objects.label());
            let mut command = pg_dumpall.command();
            command.args(pg_dumpall_args(config, database.as_deref(), objects));
            runner
                .run_to_console(command)
                .await
                .with_context(|| format!("Error dumping {}", objects.label()))?;
        }
    }

    let mut command = tools.pg_dump.command();
    command.args(pg_dump_args(config));
    runner
        .run_to_console(command)
        .await
        .context("pg_dump run failed")?;
    Ok(())
}

fn create_dump_dir(dir: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(dir)
        .with_context(|| format!("Failed to create dump directory {}", dir.display()))
}

pub fn pg_dump_args(config: &Config) -> Vec<String> {
    let mut args = vec![
        format!("--dbname={}", config.db_uri),
        "--format=directory".to_string(),
        format!("--file={}", config.pg_dump_dir.display()),
    ];
    if config.verbose {
        args.push("--verbose".to_string());
    }
    if config.is_parallel() {
        args.push(format!("--jobs={}", config.jobs));
    }
    args
}

pub fn pg_dumpall_args(
    config: &Config,
    database: Option<&str>,
    objects: GlobalObjects,
) -> Vec<String> {
    let output: PathBuf = config.dump_dir.join(objects.file_name());
    let mut args = vec![format!("--dbname={}", config.db_uri)];
    // Without --database pg_dumpall would connect to the postgres database instead
    if let Some(database) = database {
        args.push(format!("--database={}", database));
    }
    args.push(format!("--file={}", output.display()));
    // Passwords live in pg_authid, which managed services do not expose
    args.push("--no-role-passwords".to_string());
    args.push(objects.flag().to_string());
    args
}
