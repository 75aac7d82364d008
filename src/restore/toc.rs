// ABOUTME: Builds the filtered table of contents every pg_restore pass reads
// ABOUTME: Leaves out the extension comment, which only a superuser may restore

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use crate::command::CommandRunner;
use crate::tools::LocatedTool;

/// Extensions have no owner, so commenting on one requires superuser. The
/// comment is reset when the extension is created anyway, and an error from
/// it could not be told apart from a real one, so it is never restored.
pub const EXTENSION_COMMENT_ENTRY: &str = "COMMENT - EXTENSION timescaledb";

/// Writes `pg_restore --list` of the dump, minus skipped entries, to a temp file.
pub async fn build_filtered_toc(
    pg_restore: &LocatedTool,
    dump_dir: &std::path::Path,
) -> Result<NamedTempFile> {
    let toc = tempfile::Builder::new()
        .prefix("ts_restore_toc")
        .tempfile()
        .context("Failed to create table of contents file")?;
    let handle = toc
        .reopen()
        .context("Failed to open table of contents file")?;
    let mut writer = tokio::fs::File::from_std(handle);

    let mut list = pg_restore.command();
    list.arg("--list").arg(dump_dir);

    CommandRunner::new()
        .filter(EXTENSION_COMMENT_ENTRY)
        .run(list, &mut writer, &mut tokio::io::stderr())
        .await
        .context("Failed to list dump contents")?;
    writer
        .sync_all()
        .await
        .context("Failed to write table of contents file")?;

    Ok(toc)
}
