// ABOUTME: Database operations the job mover performs each tick and on cleanup
// ABOUTME: PgJobStore runs them over one dedicated connection in the detected dialect

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::future::Future;
use tokio_postgres::Client;

use super::dialect::{Dialect, JobQueries};
use super::{JobId, MoverSettings};
use crate::error::BackupError;
use crate::postgres;

/// A job pushed out of the danger window, with the start it had before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovedJob {
    pub id: JobId,
    pub original_start: DateTime<Utc>,
}

pub trait JobStore: Send + Sync + 'static {
    /// Reschedules risky jobs about to start and returns what was moved.
    fn move_upcoming(&self) -> impl Future<Output = Result<Vec<MovedJob>>> + Send;

    /// Ids of risky jobs currently executing, or `None` when there are none.
    fn running_jobs(&self) -> impl Future<Output = Result<Option<String>>> + Send;

    fn current_time(&self) -> impl Future<Output = Result<DateTime<Utc>>> + Send;

    fn reschedule(
        &self,
        job: JobId,
        next_start: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send;
}

pub struct PgJobStore {
    client: Client,
    queries: JobQueries,
    settings: MoverSettings,
}

impl PgJobStore {
    pub async fn connect(
        db_uri: &str,
        pause_udas: bool,
        settings: MoverSettings,
    ) -> Result<Self> {
        let client = postgres::connect(db_uri).await?;

        let row = client
            .query_opt(
                "SELECT split_part(extversion, '.', 1)::int \
                 FROM pg_catalog.pg_extension WHERE extname = 'timescaledb' LIMIT 1",
                &[],
            )
            .await
            .context("Failed to query TimescaleDB version")?;
        let major: i32 = match row {
            Some(row) => row
                .try_get(0)
                .context("Failed to decode TimescaleDB version")?,
            None => {
                return Err(BackupError::Version(
                    "TimescaleDB extension is not installed".to_string(),
                )
                .into())
            }
        };

        let dialect = Dialect::for_major_version(major, pause_udas)?;
        tracing::debug!("Using {:?} job queries for TimescaleDB {}.x", dialect, major);

        Ok(Self {
            client,
            queries: dialect.queries(),
            settings,
        })
    }
}

impl JobStore for PgJobStore {
    fn move_upcoming(&self) -> impl Future<Output = Result<Vec<MovedJob>>> + Send {
        async move {
            let window = self.settings.danger_window.as_secs_f64();
            let offset = self.settings.move_offset.as_secs_f64();
            let jitter = self.settings.move_jitter.as_secs_f64();

            let rows = self
                .client
                .query(self.queries.move_jobs.as_str(), &[&window, &offset, &jitter])
                .await
                .context("Failed to move upcoming jobs")?;

            rows.iter()
                .map(|row| -> Result<MovedJob> {
                    Ok(MovedJob {
                        id: row.try_get(0).context("Failed to decode moved job id")?,
                        original_start: row
                            .try_get(1)
                            .context("Failed to decode previous start of moved job")?,
                    })
                })
                .collect()
        }
    }

    fn running_jobs(&self) -> impl Future<Output = Result<Option<String>>> + Send {
        async move {
            let row = self
                .client
                .query_opt(self.queries.running_jobs.as_str(), &[])
                .await
                .context("Failed to check for running jobs")?;
            row.map(|row| row.try_get(0))
                .transpose()
                .context("Failed to decode running job ids")
        }
    }

    fn current_time(&self) -> impl Future<Output = Result<DateTime<Utc>>> + Send {
        async move {
            let row = self
                .client
                .query_one("SELECT now()", &[])
                .await
                .context("Failed to read database clock")?;
            row.try_get(0).context("Failed to decode database clock")
        }
    }

    fn reschedule(
        &self,
        job: JobId,
        next_start: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            self.client
                .query_opt(self.queries.restore_job.as_str(), &[&job, &next_start])
                .await
                .with_context(|| format!("Failed to reschedule job {}", job))?;
            Ok(())
        }
    }
}
