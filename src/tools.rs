// ABOUTME: Locates pg_dump, pg_dumpall and pg_restore on PATH
// ABOUTME: Reports their versions so mismatched client tools show up in the logs

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::error::BackupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    PgDump,
    PgDumpAll,
    PgRestore,
}

impl Tool {
    pub fn binary_name(self) -> &'static str {
        match self {
            Tool::PgDump => "pg_dump",
            Tool::PgDumpAll => "pg_dumpall",
            Tool::PgRestore => "pg_restore",
        }
    }

    pub fn locate(self) -> Result<LocatedTool> {
        let path = which::which(self.binary_name()).map_err(|_| {
            BackupError::Environment(format!(
                "{} not found, please make sure it is installed and on PATH",
                self.binary_name()
            ))
        })?;
        Ok(LocatedTool { tool: self, path })
    }
}

#[derive(Debug, Clone)]
pub struct LocatedTool {
    tool: Tool,
    path: PathBuf,
}

impl LocatedTool {
    /// A tool at a known path, bypassing the PATH lookup.
    pub fn new(tool: Tool, path: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn command(&self) -> Command {
        Command::new(&self.path)
    }

    /// Output of `<tool> --version`, trimmed.
    pub async fn version(&self) -> Result<String> {
        let output = self
            .command()
            .arg("--version")
            .output()
            .await
            .with_context(|| format!("Failed to get version of {}", self.tool.binary_name()))?;

        if !output.status.success() {
            return Err(BackupError::Environment(format!(
                "{} --version failed: {}",
                self.tool.binary_name(),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn log_version(&self) -> Result<()> {
        let version = self.version().await?;
        tracing::info!("{} version: {}", self.tool.binary_name(), version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_names() {
        assert_eq!(Tool::PgDump.binary_name(), "pg_dump");
        assert_eq!(Tool::PgDumpAll.binary_name(), "pg_dumpall");
        assert_eq!(Tool::PgRestore.binary_name(), "pg_restore");
    }

    #[tokio::test]
    async fn test_failing_version_query_is_environment_error() {
        // `false` exits non-zero whatever it is asked
        let tool = LocatedTool::new(Tool::PgRestore, which::which("false").unwrap());
        let err = tool.version().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BackupError>(),
            Some(BackupError::Environment(_))
        ));
    }
}
