//! Worker pool rows.
//!
//! A pool is a named, long-lived group of workers serving one model/adapter.
//! The leader converges `spawned_workers` toward `desired_workers`; status
//! moves along a DAG and never leaves `stopped` or `evicted`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::audit::{self, AuditEventType};
use super::{Store, StoreError, StoreResult};
use crate::common::ids;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "pool_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Starting,
    Running,
    Draining,
    Stopped,
    Evicted,
}

impl PoolStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PoolStatus::Stopped | PoolStatus::Evicted)
    }

    /// A draining or terminal pool accepts no new jobs.
    pub fn accepts_jobs(&self) -> bool {
        matches!(self, PoolStatus::Starting | PoolStatus::Running)
    }

    pub fn can_transition_to(&self, next: PoolStatus) -> bool {
        use PoolStatus::*;
        matches!(
            (self, next),
            (Starting, Running) | (Running, Draining) | (Draining, Stopped) | (Running, Evicted)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolStatus::Starting => "starting",
            PoolStatus::Running => "running",
            PoolStatus::Draining => "draining",
            PoolStatus::Stopped => "stopped",
            PoolStatus::Evicted => "evicted",
        }
    }
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct WorkerPool {
    pub id: Uuid,
    pub agent: String,
    pub model_id: String,
    pub adapter_id: Option<String>,
    pub desired_workers: i32,
    pub spawned_workers: i32,
    pub status: PoolStatus,
    pub hold_seconds: i64,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub drained_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const POOL_COLUMNS: &str = "id, agent, model_id, adapter_id, desired_workers, spawned_workers, \
                            status, hold_seconds, started_at, last_heartbeat_at, drained_at, \
                            metadata, created_at, updated_at";

/// Parameters for a new pool.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct PoolSpec {
    pub agent: String,
    pub model_id: String,
    #[builder(default, setter(strip_option))]
    pub adapter_id: Option<String>,
    pub desired_workers: i32,
    /// Minimum pool lifetime; `None` takes the policy default.
    #[builder(default, setter(strip_option))]
    pub hold_seconds: Option<i64>,
    #[builder(default = serde_json::json!({}))]
    pub metadata: serde_json::Value,
}

impl Store {
    pub async fn create_pool(&self, spec: &PoolSpec) -> StoreResult<WorkerPool> {
        if spec.desired_workers < 1 {
            return Err(StoreError::Conflict(
                "desired_workers must be at least 1".to_string(),
            ));
        }
        let hold = spec
            .hold_seconds
            .unwrap_or(self.policy().pool_hold_seconds_default as i64);

        let mut tx = self.pool().begin().await?;

        let id = ids::new_id();
        let pool = sqlx::query_as::<_, WorkerPool>(&format!(
            r#"
            INSERT INTO worker_pools
                (id, agent, model_id, adapter_id, desired_workers, spawned_workers, status,
                 hold_seconds, started_at, last_heartbeat_at, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 0, 'starting', $6, NOW(), NOW(), $7, NOW(), NOW())
            RETURNING {POOL_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&spec.agent)
        .bind(&spec.model_id)
        .bind(&spec.adapter_id)
        .bind(spec.desired_workers)
        .bind(hold)
        .bind(&spec.metadata)
        .fetch_one(&mut *tx)
        .await?;

        audit::record(
            &mut tx,
            AuditEventType::PoolCreated,
            &id.to_string(),
            serde_json::json!({
                "agent": spec.agent,
                "model_id": spec.model_id,
                "desired_workers": spec.desired_workers,
            }),
        )
        .await?;
        tx.commit().await?;

        Ok(pool)
    }

    /// Move a pool along its status DAG. Illegal edges are rejected before
    /// any write; re-asserting the current status is a no-op.
    pub async fn set_pool_status(&self, id: Uuid, next: PoolStatus) -> StoreResult<WorkerPool> {
        let mut tx = self.pool().begin().await?;

        let current = sqlx::query_as::<_, WorkerPool>(&format!(
            "SELECT {POOL_COLUMNS} FROM worker_pools WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::Unknown)?;

        if current.status == next {
            tx.rollback().await?;
            return Ok(current);
        }
        if !current.status.can_transition_to(next) {
            tx.rollback().await?;
            return Err(StoreError::IllegalTransition(format!(
                "pool {} cannot move {} -> {}",
                id, current.status, next
            )));
        }

        let pool = sqlx::query_as::<_, WorkerPool>(&format!(
            r#"
            UPDATE worker_pools
            SET status = $2,
                drained_at = CASE WHEN $2 IN ('draining', 'stopped', 'evicted')
                                  THEN COALESCE(drained_at, NOW())
                                  ELSE drained_at END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {POOL_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(next)
        .fetch_one(&mut *tx)
        .await?;

        audit::record(
            &mut tx,
            AuditEventType::PoolStatusChanged,
            &id.to_string(),
            serde_json::json!({ "from": current.status, "to": next }),
        )
        .await?;
        tx.commit().await?;

        Ok(pool)
    }

    /// Record workers joining or leaving; `spawned_workers` never drops
    /// below zero.
    pub async fn adjust_spawned_workers(&self, id: Uuid, delta: i32) -> StoreResult<WorkerPool> {
        let pool = sqlx::query_as::<_, WorkerPool>(&format!(
            r#"
            UPDATE worker_pools
            SET spawned_workers = GREATEST(spawned_workers + $2, 0),
                last_heartbeat_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {POOL_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(delta)
        .fetch_optional(self.pool())
        .await?
        .ok_or(StoreError::Unknown)?;

        Ok(pool)
    }

    pub async fn find_pool(&self, id: Uuid) -> StoreResult<Option<WorkerPool>> {
        let pool = sqlx::query_as::<_, WorkerPool>(&format!(
            "SELECT {POOL_COLUMNS} FROM worker_pools WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        Ok(pool)
    }

    pub async fn list_pools(&self, status: Option<PoolStatus>) -> StoreResult<Vec<WorkerPool>> {
        let pools = match status {
            Some(status) => {
                sqlx::query_as::<_, WorkerPool>(&format!(
                    "SELECT {POOL_COLUMNS} FROM worker_pools WHERE status = $1 ORDER BY created_at ASC"
                ))
                .bind(status)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, WorkerPool>(&format!(
                    "SELECT {POOL_COLUMNS} FROM worker_pools ORDER BY created_at ASC"
                ))
                .fetch_all(self.pool())
                .await?
            }
        };

        Ok(pools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_edges_are_legal() {
        assert!(PoolStatus::Starting.can_transition_to(PoolStatus::Running));
        assert!(PoolStatus::Running.can_transition_to(PoolStatus::Draining));
        assert!(PoolStatus::Draining.can_transition_to(PoolStatus::Stopped));
        assert!(PoolStatus::Running.can_transition_to(PoolStatus::Evicted));
    }

    #[test]
    fn terminal_pools_stay_terminal() {
        for next in [
            PoolStatus::Starting,
            PoolStatus::Running,
            PoolStatus::Draining,
            PoolStatus::Stopped,
            PoolStatus::Evicted,
        ] {
            assert!(!PoolStatus::Stopped.can_transition_to(next));
            assert!(!PoolStatus::Evicted.can_transition_to(next));
        }
    }

    #[test]
    fn draining_pools_accept_no_jobs() {
        assert!(PoolStatus::Running.accepts_jobs());
        assert!(PoolStatus::Starting.accepts_jobs());
        assert!(!PoolStatus::Draining.accepts_jobs());
        assert!(!PoolStatus::Stopped.accepts_jobs());
        assert!(!PoolStatus::Evicted.accepts_jobs());
    }

    #[test]
    fn no_shortcut_from_starting_to_stopped() {
        assert!(!PoolStatus::Starting.can_transition_to(PoolStatus::Stopped));
        assert!(!PoolStatus::Starting.can_transition_to(PoolStatus::Evicted));
    }
}
