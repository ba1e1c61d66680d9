//! Job rows and their state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::audit::{self, AuditEventType};
use super::{Store, StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Claimed,
    Running,
    Done,
    Failed,
    DeadLetter,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::DeadLetter)
    }

    /// Legal edges of the job state machine. Every job mutator checks this
    /// before writing, the same way `PoolStatus` gates pool writes.
    ///
    /// `failed -> claimed` is the retry edge (the claim additionally checks
    /// the attempt budget). `claimed|running -> pending` is the reclaim
    /// re-entry for jobs whose worker died; `claimed|running -> dead_letter`
    /// is the reclaimer dead-lettering such a job once its budget is gone.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Claimed)
                | (Claimed, Running)
                | (Claimed, Failed)
                | (Claimed, Pending)
                | (Claimed, DeadLetter)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Pending)
                | (Running, DeadLetter)
                | (Failed, Claimed)
                | (Failed, DeadLetter)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work with an externally stable identifier.
#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub pool_id: Option<Uuid>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub worker_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str = "id, job_type, payload, status, pool_id, attempts, max_attempts, \
                           worker_id, last_error, created_at, updated_at";

/// Result of an idempotent submission.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// New row inserted.
    Created(Job),
    /// Identical submission already existed; no new row.
    Duplicate(Job),
}

impl SubmitOutcome {
    pub fn job(&self) -> &Job {
        match self {
            SubmitOutcome::Created(job) | SubmitOutcome::Duplicate(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, SubmitOutcome::Created(_))
    }
}

impl Store {
    /// Insert a job row, idempotent on id.
    ///
    /// Re-submitting an id is fine iff type and payload match the existing
    /// row; a mismatch is a `Conflict`.
    pub async fn put_job(
        &self,
        id: &str,
        job_type: &str,
        payload: &serde_json::Value,
        pool_id: Option<Uuid>,
    ) -> StoreResult<SubmitOutcome> {
        let max_attempts = self.policy().job_max_attempts;
        self.retry()
            .run("store.put_job", StoreError::is_transient, || async move {
                self.put_job_once(id, job_type, payload, pool_id, max_attempts)
                    .await
            })
            .await
    }

    async fn put_job_once(
        &self,
        id: &str,
        job_type: &str,
        payload: &serde_json::Value,
        pool_id: Option<Uuid>,
        max_attempts: i32,
    ) -> StoreResult<SubmitOutcome> {
        let mut tx = self.pool().begin().await?;

        let inserted = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO orchestrator_jobs
                (id, job_type, payload, status, pool_id, attempts, max_attempts, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', $4, 0, $5, NOW(), NOW())
            ON CONFLICT (id) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(job_type)
        .bind(payload)
        .bind(pool_id)
        .bind(max_attempts)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match inserted {
            Some(job) => {
                audit::record(
                    &mut tx,
                    AuditEventType::JobSubmitted,
                    id,
                    serde_json::json!({ "job_type": job_type }),
                )
                .await?;
                SubmitOutcome::Created(job)
            }
            None => {
                let existing = sqlx::query_as::<_, Job>(&format!(
                    "SELECT {JOB_COLUMNS} FROM orchestrator_jobs WHERE id = $1"
                ))
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;

                if existing.job_type != job_type || &existing.payload != payload {
                    return Err(StoreError::Conflict(format!(
                        "job '{}' resubmitted with different type or payload",
                        id
                    )));
                }
                SubmitOutcome::Duplicate(existing)
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn find_job(&self, id: &str) -> StoreResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM orchestrator_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> StoreResult<Job> {
        self.find_job(id).await?.ok_or(StoreError::Unknown)
    }

    /// Atomically claim a job for a worker.
    ///
    /// Moves `pending` (or `failed` with attempts remaining) to `claimed`
    /// and bumps the attempt counter. A job in any other state yields
    /// `AlreadyClaimed` so duplicate deliveries can be acked without work.
    pub async fn claim_job(&self, id: &str, worker_id: &str) -> StoreResult<Job> {
        let mut tx = self.pool().begin().await?;

        let current = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM orchestrator_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(current) = current else {
            tx.rollback().await?;
            return Err(StoreError::Unknown);
        };

        let has_budget =
            current.status != JobStatus::Failed || current.attempts < current.max_attempts;
        if !current.status.can_transition_to(JobStatus::Claimed) || !has_budget {
            tx.rollback().await?;
            return Err(StoreError::AlreadyClaimed {
                status: current.status,
            });
        }

        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE orchestrator_jobs
            SET status = 'claimed',
                worker_id = $2,
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(worker_id)
        .fetch_one(&mut *tx)
        .await?;

        audit::record(
            &mut tx,
            AuditEventType::JobClaimed,
            id,
            serde_json::json!({ "worker_id": worker_id, "attempt": job.attempts }),
        )
        .await?;
        tx.commit().await?;

        Ok(job)
    }

    /// `claimed -> running`, recorded against the claiming worker.
    pub async fn mark_job_running(&self, id: &str, worker_id: &str) -> StoreResult<Job> {
        let mut tx = self.pool().begin().await?;

        let current = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM orchestrator_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::Unknown)?;

        if !current.status.can_transition_to(JobStatus::Running)
            || current.worker_id.as_deref() != Some(worker_id)
        {
            tx.rollback().await?;
            return Err(StoreError::IllegalTransition(format!(
                "job '{}' is not claimed by worker '{}'",
                id, worker_id
            )));
        }

        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE orchestrator_jobs
            SET status = 'running', updated_at = NOW()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        audit::record(
            &mut tx,
            AuditEventType::JobRunning,
            id,
            serde_json::json!({ "worker_id": worker_id }),
        )
        .await?;
        tx.commit().await?;

        Ok(job)
    }

    /// Terminal-or-retryable finalization.
    ///
    /// `done` and `failed` come from workers; `dead_letter` comes from the
    /// reclaimer once the attempt budget is gone. The state machine gates
    /// the write, so terminal rows refuse further changes.
    pub async fn finalize_job(
        &self,
        id: &str,
        status: JobStatus,
        last_error: Option<&str>,
    ) -> StoreResult<Job> {
        if !matches!(
            status,
            JobStatus::Done | JobStatus::Failed | JobStatus::DeadLetter
        ) {
            return Err(StoreError::IllegalTransition(format!(
                "finalize_job cannot set status '{}'",
                status
            )));
        }

        let mut tx = self.pool().begin().await?;

        let current = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM orchestrator_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::Unknown)?;

        if !current.status.can_transition_to(status) {
            tx.rollback().await?;
            return Err(StoreError::IllegalTransition(format!(
                "job '{}' cannot move {} -> {}",
                id, current.status, status
            )));
        }

        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE orchestrator_jobs
            SET status = $2, last_error = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(status)
        .bind(last_error)
        .fetch_one(&mut *tx)
        .await?;

        let event = if status == JobStatus::DeadLetter {
            AuditEventType::JobDeadLettered
        } else {
            AuditEventType::JobFinalized
        };
        audit::record(
            &mut tx,
            event,
            id,
            serde_json::json!({ "status": status, "last_error": last_error }),
        )
        .await?;
        tx.commit().await?;

        Ok(job)
    }

    /// Return a stalled job to the claimable set after its delivery was
    /// reclaimed. A `claimed`/`running` row (its worker is presumed dead)
    /// re-enters `pending` with no owner; a `pending` or `failed` row is
    /// already claimable and only gets the audit mark.
    pub async fn reset_job_for_retry(&self, id: &str) -> StoreResult<Job> {
        let mut tx = self.pool().begin().await?;

        let current = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM orchestrator_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::Unknown)?;

        if current.status.is_terminal() {
            tx.rollback().await?;
            return Err(StoreError::IllegalTransition(format!(
                "job '{}' is already terminal ({})",
                id, current.status
            )));
        }

        let job = if current.status.can_transition_to(JobStatus::Pending) {
            sqlx::query_as::<_, Job>(&format!(
                r#"
                UPDATE orchestrator_jobs
                SET status = 'pending', worker_id = NULL, updated_at = NOW()
                WHERE id = $1
                RETURNING {JOB_COLUMNS}
                "#
            ))
            .bind(id)
            .fetch_one(&mut *tx)
            .await?
        } else {
            sqlx::query_as::<_, Job>(&format!(
                r#"
                UPDATE orchestrator_jobs
                SET updated_at = NOW()
                WHERE id = $1
                RETURNING {JOB_COLUMNS}
                "#
            ))
            .bind(id)
            .fetch_one(&mut *tx)
            .await?
        };

        audit::record(
            &mut tx,
            AuditEventType::JobReclaimed,
            id,
            serde_json::json!({ "attempts": job.attempts }),
        )
        .await?;
        tx.commit().await?;

        Ok(job)
    }

    /// Jobs still in flight for a pool (anything non-terminal).
    pub async fn count_open_jobs_for_pool(&self, pool_id: Uuid) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM orchestrator_jobs
            WHERE pool_id = $1 AND status NOT IN ('done', 'dead_letter')
            "#,
        )
        .bind(pool_id)
        .fetch_one(self.pool())
        .await?;

        Ok(count)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_claims_and_runs() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Claimed));
        assert!(JobStatus::Claimed.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Done));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn failed_can_retry_or_dead_letter() {
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Claimed));
        assert!(JobStatus::Failed.can_transition_to(JobStatus::DeadLetter));
    }

    #[test]
    fn stalled_claims_reenter_pending_or_dead_letter() {
        // The reclaim edges: a dead worker's job goes back to pending, or
        // straight to dead_letter once the budget is gone.
        assert!(JobStatus::Claimed.can_transition_to(JobStatus::Pending));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Pending));
        assert!(JobStatus::Claimed.can_transition_to(JobStatus::DeadLetter));
        assert!(JobStatus::Running.can_transition_to(JobStatus::DeadLetter));
        // But never out of nowhere.
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::DeadLetter));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn terminal_states_have_no_out_edges() {
        for next in [
            JobStatus::Pending,
            JobStatus::Claimed,
            JobStatus::Running,
            JobStatus::Done,
            JobStatus::Failed,
            JobStatus::DeadLetter,
        ] {
            assert!(!JobStatus::Done.can_transition_to(next));
            assert!(!JobStatus::DeadLetter.can_transition_to(next));
        }
    }

    #[test]
    fn pending_cannot_skip_to_running() {
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Done));
    }

    #[test]
    fn terminal_is_done_or_dead_letter() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::DeadLetter.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
