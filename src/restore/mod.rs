// ABOUTME: Restores a dump made by this tool into a database with TimescaleDB
// ABOUTME: Recreates the extension, runs four ordered pg_restore passes and verifies the result

//! A plain `pg_restore` cannot restore a TimescaleDB database in parallel,
//! nor as a non-superuser. The restore is therefore split up:
//!
//! 1. the extension is recreated at the dumped version and put in restore mode,
//! 2. the pre-data section is restored in one transaction,
//! 3. the catalog schemas' data is restored by a single worker,
//! 4. all other data and the post-data section are restored in parallel,
//! 5. the extension leaves restore mode, is optionally updated, and is verified.

pub mod phases;
pub mod toc;

use anyhow::{Context, Result};
use std::future::Future;

use crate::command::CommandRunner;
use crate::config::Config;
use crate::error::combine_errors;
use crate::extension::{self, PgExtensionCatalog, PgRestoreHooks, RestoreHook, RestoreHooks};
use crate::info::TimescaleInfo;
use crate::tools::{LocatedTool, Tool};

pub use phases::{plan_phases, run_phases, RestorePhase, CATALOG_SCHEMAS};
pub use toc::build_filtered_toc;

pub async fn restore(config: &Config) -> Result<()> {
    // Nothing may touch the target database until the metadata is known good
    let info = TimescaleInfo::read_from(&config.info_file)?;
    let expected = info.extension_state();
    tracing::info!(
        "Restoring dump of TimescaleDB {} (schema {})",
        expected.version,
        expected.schema
    );

    let pg_restore = Tool::PgRestore.locate()?;
    pg_restore.log_version().await?;

    extension::recreate_at_version(&config.db_uri, &expected)
        .await
        .context("Restore failed while creating the TimescaleDB extension")?;
    let hooks = PgRestoreHooks::new(config.db_uri.as_str(), expected.schema.as_str());
    in_restore_mode(&hooks, restore_sections(config, &pg_restore)).await?;

    extension::finalize(
        &PgExtensionCatalog::new(config.db_uri.as_str()),
        &expected,
        config.restore.do_update,
    )
    .await?;

    tracing::info!("Restore completed successfully");
    Ok(())
}

/// Runs `work` with the extension in restore mode.
///
/// Once the pre restore hook succeeded the post restore hook always runs, and
/// a failure of both is reported together.
async fn in_restore_mode<H, F>(hooks: &H, work: F) -> Result<()>
where
    H: RestoreHooks,
    F: Future<Output = Result<()>>,
{
    hooks
        .run(RestoreHook::Pre)
        .await
        .context("Restore failed while preparing TimescaleDB for restore")?;

    let restored = work.await;
    // Catalog state stays locked until the post restore hook runs
    let post_restored = hooks
        .run(RestoreHook::Post)
        .await
        .context("Restore failed while taking TimescaleDB out of restore mode");
    combine_errors(restored, post_restored)
}

async fn restore_sections(config: &Config, pg_restore: &LocatedTool) -> Result<()> {
    let toc = build_filtered_toc(pg_restore, &config.pg_dump_dir).await?;
    let phases = plan_phases(config, toc.path());
    let runner = CommandRunner::new().with_timestamps(true);
    let runner = &runner;

    run_phases(&phases, |phase| {
        let mut command = pg_restore.command();
        command.args(&phase.args);
        async move { runner.run_to_console(command).await.map_err(anyhow::Error::from) }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackupError;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeHooks {
        fail_pre: bool,
        fail_post: bool,
        pre_calls: AtomicUsize,
        post_calls: AtomicUsize,
    }

    impl RestoreHooks for FakeHooks {
        fn run(&self, hook: RestoreHook) -> impl Future<Output = Result<()>> + Send {
            let failed = match hook {
                RestoreHook::Pre => {
                    self.pre_calls.fetch_add(1, Ordering::SeqCst);
                    self.fail_pre
                }
                RestoreHook::Post => {
                    self.post_calls.fetch_add(1, Ordering::SeqCst);
                    self.fail_post
                }
            };
            async move {
                if failed {
                    Err(anyhow::Error::from(BackupError::Consistency(format!(
                        "{} reported failure",
                        hook.function_name()
                    ))))
                } else {
                    Ok(())
                }
            }
        }
    }

    // Fails the catalog data pass, like a pg_restore exiting non-zero
    async fn restore_failing_catalog_pass(executed: &mut Vec<&'static str>) -> Result<()> {
        let config = Config::new("postgresql://restorer@localhost/tsdb", "/backups/tsdb").unwrap();
        let phases = plan_phases(&config, Path::new("/tmp/ts_restore_toc"));
        run_phases(&phases, |phase| {
            executed.push(phase.label);
            let fail = phase.label == "TimescaleDB catalog data";
            async move {
                if fail {
                    Err(anyhow::anyhow!("pg_restore exited unsuccessfully (exit status: 1)"))
                } else {
                    Ok(())
                }
            }
        })
        .await
    }

    #[tokio::test]
    async fn test_post_hook_runs_after_failed_phase() {
        let hooks = FakeHooks {
            fail_post: true,
            ..FakeHooks::default()
        };
        let mut executed = Vec::new();

        let err = in_restore_mode(&hooks, restore_failing_catalog_pass(&mut executed))
            .await
            .unwrap_err();

        assert_eq!(executed, vec!["pre-data section", "TimescaleDB catalog data"]);
        assert_eq!(hooks.pre_calls.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.post_calls.load(Ordering::SeqCst), 1);
        let msg = err.to_string();
        assert!(msg.contains("pg_restore failed while restoring TimescaleDB catalog data"));
        assert!(msg.contains("timescaledb_post_restore reported failure"));
    }

    #[tokio::test]
    async fn test_post_hook_runs_once_after_success() {
        let hooks = FakeHooks::default();
        in_restore_mode(&hooks, async { Ok::<(), anyhow::Error>(()) })
            .await
            .unwrap();
        assert_eq!(hooks.pre_calls.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.post_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_pre_hook_skips_restore_and_post_hook() {
        let hooks = FakeHooks {
            fail_pre: true,
            ..FakeHooks::default()
        };
        let mut executed = Vec::new();

        let err = in_restore_mode(&hooks, restore_failing_catalog_pass(&mut executed))
            .await
            .unwrap_err();

        assert!(executed.is_empty());
        assert_eq!(hooks.post_calls.load(Ordering::SeqCst), 0);
        assert!(format!("{:#}", err).contains("preparing TimescaleDB for restore"));
    }

    #[tokio::test]
    async fn test_wrong_metadata_version_fails_before_any_ddl() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(crate::config::INFO_FILE_NAME),
            r#"{"metadataVersion": 2, "extensionVersion": "2.11.2", "extensionSchema": "public"}"#,
        )
        .unwrap();
        // Port 1 refuses connections; reaching the database would surface a connection error
        let config = Config::new("postgresql://postgres@127.0.0.1:1/tsdb", dir.path()).unwrap();

        let err = restore(&config).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BackupError>(),
            Some(BackupError::Metadata(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_metadata_fails_restore() {
        let dir = TempDir::new().unwrap();
        let config = Config::new("postgresql://postgres@127.0.0.1:1/tsdb", dir.path()).unwrap();

        let err = restore(&config).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BackupError>(),
            Some(BackupError::Metadata(_))
        ));
    }
}
