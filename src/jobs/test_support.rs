// ABOUTME: In-memory job store for exercising the job mover without a database
// ABOUTME: Scripts move batches and running-job probes, and records reschedules

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use super::mover::JobMoverHandle;
use super::store::{JobStore, MovedJob};
use super::{JobId, MoverSettings};

pub(crate) fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub(crate) fn minutes(m: i64) -> chrono::Duration {
    chrono::Duration::minutes(m)
}

pub(crate) fn moved(id: JobId, original_start: DateTime<Utc>) -> MovedJob {
    MovedJob { id, original_start }
}

pub(crate) struct FakeState {
    pub move_batches: VecDeque<std::result::Result<Vec<MovedJob>, String>>,
    pub running: VecDeque<Option<String>>,
    pub running_forever: bool,
    /// Makes the next move query panic with this message.
    pub panic_on_move: Option<String>,
    pub probes: usize,
    pub now: DateTime<Utc>,
    pub fail_reschedule: Vec<JobId>,
    pub attempts: Vec<(JobId, DateTime<Utc>)>,
    pub rescheduled: Vec<(JobId, DateTime<Utc>)>,
}

#[derive(Clone)]
pub(crate) struct FakeStore(Arc<Mutex<FakeState>>);

impl FakeStore {
    pub fn new() -> Self {
        FakeStore(Arc::new(Mutex::new(FakeState {
            move_batches: VecDeque::new(),
            running: VecDeque::new(),
            running_forever: false,
            panic_on_move: None,
            probes: 0,
            now: base_time(),
            fail_reschedule: Vec::new(),
            attempts: Vec::new(),
            rescheduled: Vec::new(),
        })))
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.0.lock().unwrap()
    }
}

impl JobStore for FakeStore {
    fn move_upcoming(&self) -> impl Future<Output = Result<Vec<MovedJob>>> + Send {
        // The guard must be released before panicking or the state is poisoned
        let panic_message = self.state().panic_on_move.take();
        if let Some(message) = panic_message {
            panic!("{}", message);
        }
        let next = self.state().move_batches.pop_front();
        async move {
            match next {
                Some(Ok(batch)) => Ok(batch),
                Some(Err(msg)) => Err(anyhow::anyhow!(msg)),
                None => Ok(Vec::new()),
            }
        }
    }

    fn running_jobs(&self) -> impl Future<Output = Result<Option<String>>> + Send {
        let mut state = self.state();
        state.probes += 1;
        let running = match state.running.pop_front() {
            Some(running) => running,
            None if state.running_forever => Some("42".to_string()),
            None => None,
        };
        async move { Ok(running) }
    }

    fn current_time(&self) -> impl Future<Output = Result<DateTime<Utc>>> + Send {
        let now = self.state().now;
        async move { Ok(now) }
    }

    fn reschedule(
        &self,
        job: JobId,
        next_start: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send {
        let mut state = self.state();
        state.attempts.push((job, next_start));
        let result = if state.fail_reschedule.contains(&job) {
            Err(anyhow::anyhow!("job {} not found", job))
        } else {
            state.rescheduled.push((job, next_start));
            Ok(())
        };
        async move { result }
    }
}

pub(crate) fn start(store: &FakeStore) -> JobMoverHandle {
    let store = store.clone();
    JobMoverHandle::start(async move { Ok(store) }, MoverSettings::default(), true)
}
