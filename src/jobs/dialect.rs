// ABOUTME: Version-specific SQL for finding, moving and restoring TimescaleDB jobs
// ABOUTME: TimescaleDB 1.x exposes policy_stats, 2.x exposes jobs and job_stats

use crate::error::BackupError;

/// The SQL a job store needs, chosen once per run.
///
/// `move_jobs` takes `$1` danger window, `$2` move offset and `$3` move jitter,
/// all in seconds (`float8`), and returns `(job_id int4, prev_start timestamptz)`
/// for every job it moved. `running_jobs` returns a single text row listing
/// the ids of executing jobs, or no row at all. `restore_job` takes `$1` job id
/// and `$2` the new start time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQueries {
    pub running_jobs: String,
    pub move_jobs: String,
    pub restore_job: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    V1,
    V2 { pause_udas: bool },
}

impl Dialect {
    pub fn for_major_version(major: i32, pause_udas: bool) -> Result<Self, BackupError> {
        match major {
            1 => Ok(Dialect::V1),
            2 => Ok(Dialect::V2 { pause_udas }),
            other => Err(BackupError::Version(format!(
                "unknown TimescaleDB major version {}",
                other
            ))),
        }
    }

    pub fn queries(self) -> JobQueries {
        match self {
            Dialect::V1 => v1_queries(),
            Dialect::V2 { pause_udas } => v2_queries(pause_udas),
        }
    }
}

// In 1.x a running job shows last_finish and next_start both at -infinity.
// A job that already ran once keeps its last_finish while running again, so
// the move query also skips -infinity starts, which have no timestamp value.
fn v1_queries() -> JobQueries {
    JobQueries {
        running_jobs: "SELECT string_agg(p.job_id::text, ', ') \
            FROM timescaledb_information.policy_stats p \
            WHERE p.last_finish = '-infinity' AND p.next_start = '-infinity' \
            AND p.job_type IN ('compress_chunks', 'reorder') \
            HAVING string_agg(p.job_id::text, ', ') IS NOT NULL"
            .to_string(),
        move_jobs: "SELECT t.job_id, t.prev_start FROM \
            (SELECT (alter_job_schedule(p.job_id, next_start => now() + make_interval(secs => $2::float8 + random() * $3::float8))).*, \
            p.next_start AS prev_start \
            FROM timescaledb_information.policy_stats p \
            WHERE NOT (p.last_finish = '-infinity' AND p.next_start = '-infinity') \
            AND p.next_start > '-infinity' \
            AND p.next_start < now() + make_interval(secs => $1::float8) \
            AND p.job_type IN ('compress_chunks', 'reorder')) t"
            .to_string(),
        restore_job: "SELECT (alter_job_schedule($1::integer, next_start => $2::timestamptz)).job_id = $1::integer"
            .to_string(),
    }
}

// In 2.x a running job shows next_start at -infinity with no last run status
// while still 'Scheduled'. Job types are only distinguishable by application_name.
fn v2_queries(pause_udas: bool) -> JobQueries {
    let job_filter = if pause_udas {
        "(j.application_name LIKE 'Compression%' OR j.application_name LIKE 'Reorder%' \
         OR j.application_name LIKE 'User-Defined%')"
    } else {
        "(j.application_name LIKE 'Compression%' OR j.application_name LIKE 'Reorder%')"
    };

    JobQueries {
        running_jobs: format!(
            "SELECT string_agg(j.job_id::text, ', ') \
             FROM timescaledb_information.jobs j \
             INNER JOIN timescaledb_information.job_stats js ON j.job_id = js.job_id \
             WHERE js.next_start = '-infinity' AND js.last_run_status IS NULL AND js.job_status = 'Scheduled' \
             AND {} \
             HAVING string_agg(j.job_id::text, ', ') IS NOT NULL",
            job_filter
        ),
        move_jobs: format!(
            "SELECT t.job_id, t.prev_start FROM \
             (SELECT (alter_job(js.job_id, next_start => now() + make_interval(secs => $2::float8 + random() * $3::float8))).*, \
             js.next_start AS prev_start \
             FROM timescaledb_information.jobs j \
             INNER JOIN timescaledb_information.job_stats js ON j.job_id = js.job_id \
             WHERE NOT (js.next_start = '-infinity' AND js.last_run_status IS NULL AND js.job_status = 'Scheduled') \
             AND js.next_start > '-infinity' \
             AND js.next_start < now() + make_interval(secs => $1::float8) \
             AND {}) t",
            job_filter
        ),
        restore_job: "SELECT (alter_job($1::integer, next_start => $2::timestamptz)).job_id = $1::integer"
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_major_versions() {
        assert_eq!(Dialect::for_major_version(1, true).unwrap(), Dialect::V1);
        assert_eq!(
            Dialect::for_major_version(2, false).unwrap(),
            Dialect::V2 { pause_udas: false }
        );
    }

    #[test]
    fn test_unknown_major_versions_rejected() {
        for major in [-1, 0, 3, 4, 10] {
            let err = Dialect::for_major_version(major, true).unwrap_err();
            assert!(matches!(err, BackupError::Version(_)));
            assert!(err.to_string().contains("unknown TimescaleDB major version"));
        }
    }

    #[test]
    fn test_v1_uses_policy_stats() {
        let q = Dialect::V1.queries();
        assert!(q.running_jobs.contains("policy_stats"));
        assert!(q.move_jobs.contains("alter_job_schedule"));
        assert!(q.restore_job.contains("alter_job_schedule"));
        assert!(!q.move_jobs.contains("job_stats"));
    }

    #[test]
    fn test_v2_user_defined_actions_toggle() {
        let with = Dialect::V2 { pause_udas: true }.queries();
        let without = Dialect::V2 { pause_udas: false }.queries();

        assert!(with.move_jobs.contains("User-Defined%"));
        assert!(with.running_jobs.contains("User-Defined%"));
        assert!(!without.move_jobs.contains("User-Defined%"));
        assert!(!without.running_jobs.contains("User-Defined%"));
        assert!(without.move_jobs.contains("Compression%"));
        assert!(without.move_jobs.contains("Reorder%"));
    }

    #[test]
    fn test_move_queries_skip_jobs_without_a_start() {
        for q in [
            Dialect::V1.queries(),
            Dialect::V2 { pause_udas: true }.queries(),
            Dialect::V2 { pause_udas: false }.queries(),
        ] {
            assert!(q.move_jobs.contains("next_start > '-infinity'"));
        }
    }

    #[test]
    fn test_move_queries_take_timing_parameters() {
        for q in [Dialect::V1.queries(), Dialect::V2 { pause_udas: true }.queries()] {
            assert!(q.move_jobs.contains("$1::float8"));
            assert!(q.move_jobs.contains("$2::float8"));
            assert!(q.move_jobs.contains("$3::float8"));
        }
    }
}
