// ABOUTME: The four pg_restore passes a TimescaleDB restore is split into
// ABOUTME: Catalog data is loaded alone so the remaining passes can run in parallel

use anyhow::{Context, Result};
use std::future::Future;
use std::path::Path;

use crate::config::Config;

/// TimescaleDB catalog schemas. Their tables reference each other in a cycle,
/// so their data can only be loaded by a single worker.
pub const CATALOG_SCHEMAS: [&str; 2] = ["_timescaledb_catalog", "_timescaledb_config"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePhase {
    pub label: &'static str,
    /// Full pg_restore argument list, dump directory last.
    pub args: Vec<String>,
}

/// Builds the passes in execution order: pre-data, catalog data, other data, post-data.
pub fn plan_phases(config: &Config, toc: &Path) -> Vec<RestorePhase> {
    let mut base = vec![
        format!("--dbname={}", config.db_uri),
        "--format=directory".to_string(),
        format!("--use-list={}", toc.display()),
    ];
    if config.verbose {
        base.push("--verbose".to_string());
    }

    let mut parallel = Vec::new();
    if config.is_parallel() {
        parallel.push(format!("--jobs={}", config.jobs));
    }

    let catalog_only: Vec<String> = CATALOG_SCHEMAS
        .iter()
        .map(|schema| format!("--schema={}", schema))
        .collect();
    let catalog_excluded: Vec<String> = CATALOG_SCHEMAS
        .iter()
        .map(|schema| format!("--exclude-schema={}", schema))
        .collect();

    let phase = |label: &'static str, section: &str, extra: &[String], parallel: &[String]| {
        let mut args = base.clone();
        args.push(format!("--section={}", section));
        args.extend_from_slice(extra);
        args.extend_from_slice(parallel);
        args.extend(config.restore.pg_restore_flags.iter().cloned());
        // pg_restore wants the archive as the final positional argument
        args.push(config.pg_dump_dir.display().to_string());
        RestorePhase { label, args }
    };

    vec![
        phase(
            "pre-data section",
            "pre-data",
            &["--single-transaction".to_string()],
            &[],
        ),
        phase("TimescaleDB catalog data", "data", &catalog_only, &[]),
        phase("user data", "data", &catalog_excluded, &parallel),
        phase("post-data section", "post-data", &[], &parallel),
    ]
}

/// Runs each phase in order, stopping at the first failure.
pub async fn run_phases<F, Fut>(phases: &[RestorePhase], mut execute: F) -> Result<()>
where
    F: FnMut(&RestorePhase) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    for phase in phases {
        tracing::info!("Restoring {}", phase.label);
        execute(phase)
            .await
            .with_context(|| format!("pg_restore failed while restoring {}", phase.label))?;
    }
    Ok(())
}
