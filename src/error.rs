// ABOUTME: Error types for dump and restore operations
// ABOUTME: Separates environment, connectivity, version, metadata and consistency failures

use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;

#[derive(Debug)]
pub enum BackupError {
    /// A required binary is missing or unusable.
    Environment(String),
    Connection(String),
    /// Unexpected TimescaleDB version or job dialect.
    Version(String),
    Metadata(String),
    /// The database is not in the state the operation expected; needs manual intervention.
    Consistency(String),
    JobsStillRunning(Duration),
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BackupError::Environment(msg) => write!(f, "Environment error: {}", msg),
            BackupError::Connection(msg) => write!(f, "Connection error: {}", msg),
            BackupError::Version(msg) => write!(f, "Version error: {}", msg),
            BackupError::Metadata(msg) => write!(f, "Metadata error: {}", msg),
            BackupError::Consistency(msg) => write!(f, "Consistency error: {}", msg),
            BackupError::JobsStillRunning(waited) => write!(
                f,
                "Timed out after {}s waiting for background jobs to stop; a parallel dump cannot safely proceed",
                waited.as_secs()
            ),
        }
    }
}

impl std::error::Error for BackupError {}

/// Failure of a wrapped subprocess.
#[derive(Debug)]
pub enum CommandError {
    Start {
        program: String,
        source: std::io::Error,
    },
    Stream {
        program: String,
        source: std::io::Error,
    },
    Exit {
        program: String,
        status: ExitStatus,
    },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommandError::Start { program, source } => {
                write!(f, "failed to start {}: {}", program, source)
            }
            CommandError::Stream { program, source } => {
                write!(f, "failed to capture output of {}: {}", program, source)
            }
            CommandError::Exit { program, status } => {
                write!(f, "{} exited unsuccessfully ({})", program, status)
            }
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Start { source, .. } | CommandError::Stream { source, .. } => {
                Some(source)
            }
            CommandError::Exit { .. } => None,
        }
    }
}

/// Merges the result of a primary operation with the result of its cleanup step.
///
/// When both fail, the returned error carries both messages.
pub fn combine_errors(
    primary: anyhow::Result<()>,
    cleanup: anyhow::Result<()>,
) -> anyhow::Result<()> {
    match (primary, cleanup) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Err(primary), Err(cleanup)) => Err(anyhow::anyhow!(
            "{:#}; cleanup also failed: {:#}",
            primary,
            cleanup
        )),
    }
}
