//! Identifier helpers.

use uuid::Uuid;

/// New lease token / pool id.
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}

/// Generated job id for submissions that do not supply one.
///
/// Callers may supply any globally unique string; generated ids use the
/// hyphenless uuid form so they are unambiguous in stream entries and logs.
pub fn new_job_id() -> String {
    format!("job-{}", Uuid::new_v4().simple())
}

/// Stable identity for a worker process.
pub fn new_worker_id() -> String {
    format!("worker-{}", Uuid::new_v4())
}
