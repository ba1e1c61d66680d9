//! Authoritative relational state store.
//!
//! Postgres holds the lease table, worker pools, jobs, the append-only audit
//! log, and the leader lock. Rows here are the source of truth; the event bus
//! only carries work, never state. Every mutator writes its audit row in the
//! same transaction.

mod audit;
mod job;
mod leader;
mod lease;
mod pool;

pub use audit::{AuditEvent, AuditEventType};
pub use job::{Job, JobStatus, SubmitOutcome};
pub use leader::{LockHandle, LEADER_LOCK_NAME};
pub use lease::{Lease, LeaseMode, LeaseSpec};
pub use pool::{PoolSpec, PoolStatus, WorkerPool};

use sqlx::PgPool;
use thiserror::Error;

use crate::common::RetryPolicy;
use crate::config::Policy;

/// Store error taxonomy.
///
/// `Transient` is the only kind the adapters retry internally; everything
/// else surfaces to the caller unchanged.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Uniqueness or idempotency violation (duplicate with mismatch).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Referenced row does not exist.
    #[error("row not found")]
    Unknown,

    /// The lease is past its expiry (or past its maximum lifetime).
    #[error("lease expired")]
    Expired,

    /// The job is not claimable; carries the status that blocked the claim.
    #[error("job already claimed (status {status})")]
    AlreadyClaimed { status: JobStatus },

    /// Illegal state-machine transition.
    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    /// Retry-safe I/O failure.
    #[error("transient database error: {0}")]
    Transient(#[source] sqlx::Error),

    /// Schema or configuration problem; not retryable.
    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::Unknown,
            sqlx::Error::Database(db) => {
                if db.is_unique_violation() {
                    StoreError::Conflict(db.to_string())
                } else {
                    StoreError::Transient(sqlx::Error::Database(db))
                }
            }
            e @ (sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Configuration(_)) => StoreError::Fatal(e.to_string()),
            other => StoreError::Transient(other),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Handle to the relational store.
///
/// Cheap to clone; all operations run against the shared pool. Transient
/// failures are retried with the shared policy before surfacing — each
/// operation is a single transaction, so a retry never half-applies.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    policy: Policy,
    retry: RetryPolicy,
}

impl Store {
    pub fn new(pool: PgPool, policy: Policy) -> Self {
        Self {
            pool,
            policy,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(pool: PgPool, policy: Policy, retry: RetryPolicy) -> Self {
        Self {
            pool,
            policy,
            retry,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub(crate) fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Liveness probe used by `/ready` and startup.
    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
