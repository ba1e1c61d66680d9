//! Append-only audit log.
//!
//! One row per state transition, written inside the mutator's transaction.
//! Ordering per entity follows the monotonic id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};

use super::{Store, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "audit_event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    LeaseGranted,
    LeaseExtended,
    LeaseReleased,
    LeaseExpired,
    PoolCreated,
    PoolStatusChanged,
    JobSubmitted,
    JobClaimed,
    JobRunning,
    JobFinalized,
    JobReclaimed,
    JobDeadLettered,
    LeaderAcquired,
    LeaderRenewFailed,
    LeaderReleased,
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: i64,
    pub occurred_at: DateTime<Utc>,
    pub event_type: AuditEventType,
    /// Token, pool id, job id, or lock name the event describes.
    pub entity_id: String,
    pub detail: serde_json::Value,
}

/// Append an audit row on the given connection (normally a transaction).
pub(super) async fn record(
    conn: &mut PgConnection,
    event_type: AuditEventType,
    entity_id: &str,
    detail: serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO orchestrator_audit (occurred_at, event_type, entity_id, detail)
        VALUES (NOW(), $1, $2, $3)
        "#,
    )
    .bind(event_type)
    .bind(entity_id)
    .bind(detail)
    .execute(conn)
    .await?;

    Ok(())
}

impl Store {
    /// Most recent audit rows, newest first.
    pub async fn recent_audit(&self, limit: i64) -> StoreResult<Vec<AuditEvent>> {
        let events = sqlx::query_as::<_, AuditEvent>(
            r#"
            SELECT id, occurred_at, event_type, entity_id, detail
            FROM orchestrator_audit
            ORDER BY id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(events)
    }

    /// Audit rows for one entity in transition order.
    pub async fn audit_for_entity(&self, entity_id: &str) -> StoreResult<Vec<AuditEvent>> {
        let events = sqlx::query_as::<_, AuditEvent>(
            r#"
            SELECT id, occurred_at, event_type, entity_id, detail
            FROM orchestrator_audit
            WHERE entity_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(entity_id)
        .fetch_all(self.pool())
        .await?;

        Ok(events)
    }
}
