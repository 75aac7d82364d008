// ABOUTME: Background task that reschedules risky jobs for the duration of a dump
// ABOUTME: Signals once when running jobs have stopped and restores schedules on cancel

use anyhow::Result;
use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use rand::Rng;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::{JobStore, MovedJob, PgJobStore};
use super::{JobId, MoverSettings};
use crate::config::JobWaitTimeout;
use crate::error::BackupError;

/// Original start times of every job the mover has pushed back.
#[derive(Debug, Default)]
pub struct MovedJobs {
    original_starts: HashMap<JobId, DateTime<Utc>>,
}

impl MovedJobs {
    /// Records a moved job. Only the first sighting of a job counts, later
    /// sightings report an already-moved start time.
    pub fn record(&mut self, job: MovedJob) -> bool {
        match self.original_starts.entry(job.id) {
            Entry::Vacant(slot) => {
                slot.insert(job.original_start);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn original_start(&self, job: JobId) -> Option<DateTime<Utc>> {
        self.original_starts.get(&job).copied()
    }

    pub fn len(&self) -> usize {
        self.original_starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.original_starts.is_empty()
    }

    /// Empties the ledger, ordered by job id.
    pub fn drain(&mut self) -> Vec<(JobId, DateTime<Utc>)> {
        let mut entries: Vec<_> = self.original_starts.drain().collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }
}

/// When a moved job should run again.
///
/// A start still ahead of `now` is kept as is. A start that has passed is
/// spread over `(now, now + jitter]` so jobs do not all fire together.
pub fn restore_target<R: Rng + ?Sized>(
    original: DateTime<Utc>,
    now: DateTime<Utc>,
    jitter: Duration,
    rng: &mut R,
) -> DateTime<Utc> {
    if original > now {
        return original;
    }
    let max_ms = i64::try_from(jitter.as_millis()).unwrap_or(i64::MAX).max(1000);
    now + chrono::Duration::milliseconds(rng.gen_range(1000..=max_ms))
}

struct JobMover<S> {
    store: S,
    settings: MoverSettings,
    verbose: bool,
    moved: MovedJobs,
    jobs_stopped: Option<oneshot::Sender<()>>,
}

impl<S: JobStore> JobMover<S> {
    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval(self.settings.poll_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if let Err(e) = self.tick().await {
                warn!(
                    "Problem while rescheduling jobs, continuing without job protection: {:#}",
                    e
                );
                return;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
        }

        self.restore_schedules().await;
    }

    async fn tick(&mut self) -> Result<()> {
        for job in self.store.move_upcoming().await? {
            if self.moved.record(job) {
                if self.verbose {
                    info!("Moved job {} (was due at {})", job.id, job.original_start);
                } else {
                    debug!("Moved job {} (was due at {})", job.id, job.original_start);
                }
            }
        }

        // Jobs that finished are not expected to start again while the dump runs
        if self.jobs_stopped.is_none() {
            return Ok(());
        }
        match self.store.running_jobs().await? {
            Some(ids) => {
                if self.verbose {
                    info!(
                        "Background jobs {} are running and may deadlock the dump; waiting for them to finish",
                        ids
                    );
                }
            }
            None => {
                if let Some(stopped) = self.jobs_stopped.take() {
                    let _ = stopped.send(());
                }
                info!("Background jobs have stopped, continuing");
            }
        }
        Ok(())
    }

    async fn restore_schedules(&mut self) {
        if self.moved.is_empty() {
            return;
        }
        let now = match self.store.current_time().await {
            Ok(now) => now,
            Err(e) => {
                warn!("Falling back to local clock for rescheduling: {:#}", e);
                Utc::now()
            }
        };

        let targets: Vec<_> = {
            let mut rng = rand::thread_rng();
            self.moved
                .drain()
                .into_iter()
                .map(|(id, original)| {
                    let target =
                        restore_target(original, now, self.settings.restore_jitter, &mut rng);
                    (id, target)
                })
                .collect()
        };

        let mut failed = 0;
        for (id, target) in &targets {
            if self.verbose {
                info!("Scheduling job {} to start again at {}", id, target);
            }
            // A job dropped during the dump must not keep the others from being restored
            if let Err(e) = self.store.reschedule(*id, *target).await {
                warn!("Could not restore schedule of job {}: {:#}", id, e);
                failed += 1;
            }
        }
        info!(
            "Restored schedules of {} of {} moved jobs",
            targets.len() - failed,
            targets.len()
        );
    }
}

/// Handle to a running job mover.
pub struct JobMoverHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    jobs_stopped: Option<oneshot::Receiver<()>>,
}

impl JobMoverHandle {
    pub fn spawn(db_uri: &str, pause_udas: bool, verbose: bool, settings: MoverSettings) -> Self {
        let db_uri = db_uri.to_string();
        Self::start(
            async move { PgJobStore::connect(&db_uri, pause_udas, settings).await },
            settings,
            verbose,
        )
    }

    /// Starts the mover on the store produced by `connect`.
    pub fn start<S, F>(connect: F, settings: MoverSettings, verbose: bool) -> Self
    where
        S: JobStore,
        F: Future<Output = Result<S>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (stopped_tx, stopped_rx) = oneshot::channel();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let store = match connect.await {
                Ok(store) => store,
                Err(e) => {
                    warn!(
                        "Could not start rescheduling jobs, continuing without job protection: {:#}",
                        e
                    );
                    return;
                }
            };
            let mover = JobMover {
                store,
                settings,
                verbose,
                moved: MovedJobs::default(),
                jobs_stopped: Some(stopped_tx),
            };
            mover.run(token).await;
        });

        Self {
            cancel,
            task,
            jobs_stopped: Some(stopped_rx),
        }
    }

    /// Blocks until running jobs have stopped or the timeout elapses.
    ///
    /// A mover that died before confirming is not an error: the dump goes on
    /// without protection.
    pub async fn wait_for_jobs_stopped(&mut self, timeout: JobWaitTimeout) -> Result<()> {
        let Some(stopped) = self.jobs_stopped.take() else {
            return Ok(());
        };

        let received = match timeout {
            JobWaitTimeout::NoWait => {
                info!("Not waiting for running background jobs to finish");
                return Ok(());
            }
            JobWaitTimeout::Forever => {
                let spinner = waiting_spinner();
                let received = stopped.await;
                spinner.finish_and_clear();
                received
            }
            JobWaitTimeout::After(limit) => {
                let spinner = waiting_spinner();
                let waited = tokio::time::timeout(limit, stopped).await;
                spinner.finish_and_clear();
                match waited {
                    Ok(received) => received,
                    Err(_) => return Err(BackupError::JobsStillRunning(limit).into()),
                }
            }
        };

        if received.is_err() {
            warn!("Job mover stopped before confirming that jobs finished; the dump may deadlock");
        }
        Ok(())
    }

    /// Cancels the mover and waits for it to restore job schedules.
    ///
    /// Never fails: whatever went wrong inside the mover only delays jobs,
    /// so it is reported as a warning.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(
                "Job mover ended abnormally, some jobs may start later than scheduled: {}",
                e
            );
        }
    }
}

fn waiting_spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_message("Waiting for running background jobs to finish...");
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}
