// ABOUTME: Keeps TimescaleDB background jobs from deadlocking a parallel pg_dump
// ABOUTME: Jobs about to run are pushed back during the dump and put back afterwards

//! Compression and reorder jobs (and user-defined actions) perform DDL on
//! chunks. If such a job takes a lock after the main `pg_dump` process has
//! taken its read locks, and then asks for an exclusive lock, the parallel
//! `pg_dump` workers queue behind it and the dump deadlocks.
//!
//! Pausing jobs outright would leave them paused forever if the dump crashed.
//! Instead the mover repeatedly pushes jobs that are about to start a little
//! further into the future, so a crash delays a job by minutes at most, and
//! puts every moved job back on its original schedule when the dump ends.

pub mod dialect;
pub mod mover;
pub mod store;
#[cfg(test)]
pub(crate) mod test_support;

use std::time::Duration;

pub use dialect::{Dialect, JobQueries};
pub use mover::{JobMoverHandle, MovedJobs};
pub use store::{JobStore, MovedJob, PgJobStore};

/// TimescaleDB job ids are `integer`.
pub type JobId = i32;

/// Timing of the job mover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoverSettings {
    pub poll_interval: Duration,
    /// Jobs due to start within this window are moved.
    pub danger_window: Duration,
    /// Moved jobs start after `move_offset` plus up to `move_jitter`.
    pub move_offset: Duration,
    pub move_jitter: Duration,
    /// Jobs whose original start has passed resume within this window.
    pub restore_jitter: Duration,
}

impl Default for MoverSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            danger_window: Duration::from_secs(10 * 60),
            move_offset: Duration::from_secs(15 * 60),
            move_jitter: Duration::from_secs(5 * 60),
            restore_jitter: Duration::from_secs(5 * 60),
        }
    }
}
