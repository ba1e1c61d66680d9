//! Named advisory lock for leader election.
//!
//! One row per lock name. Acquisition atomically inserts or steals an
//! expired row; renewal is a compare-and-swap on (name, token) so a stolen
//! lock can never be renewed by its previous holder. TTL is enforced purely
//! by renewal cadence — there is no session state to leak.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::audit::{self, AuditEventType};
use super::{Store, StoreError, StoreResult};
use crate::common::ids;

/// The single cluster-wide lock name.
pub const LEADER_LOCK_NAME: &str = "gpu_orchestrator_leader";

/// Proof of lock ownership; renewal and release require the token.
#[derive(Debug, Clone, Serialize)]
pub struct LockHandle {
    pub name: String,
    pub holder: String,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Store {
    /// Try to take the named lock for `ttl_seconds`.
    ///
    /// `None` means a live holder owns it; nothing was written.
    pub async fn try_acquire_lock(
        &self,
        name: &str,
        holder: &str,
        ttl_seconds: u64,
    ) -> StoreResult<Option<LockHandle>> {
        let token = ids::new_id();
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query_as::<_, (Uuid, DateTime<Utc>)>(
            r#"
            INSERT INTO orchestrator_locks (name, holder, token, acquired_at, expires_at)
            VALUES ($1, $2, $3, NOW(), NOW() + ($4 || ' seconds')::INTERVAL)
            ON CONFLICT (name) DO UPDATE
                SET holder = EXCLUDED.holder,
                    token = EXCLUDED.token,
                    acquired_at = NOW(),
                    expires_at = EXCLUDED.expires_at
                WHERE orchestrator_locks.expires_at <= NOW()
            RETURNING token, expires_at
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(token)
        .bind(ttl_seconds as i64)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((_, expires_at)) = row else {
            // A live holder owns the row; nothing was written.
            tx.rollback().await?;
            return Ok(None);
        };

        audit::record(
            &mut tx,
            AuditEventType::LeaderAcquired,
            name,
            serde_json::json!({ "holder": holder }),
        )
        .await?;
        tx.commit().await?;

        Ok(Some(LockHandle {
            name: name.to_string(),
            holder: holder.to_string(),
            token,
            expires_at,
        }))
    }

    /// Push the expiry forward; fails with `Expired` once the lock has been
    /// stolen or timed out.
    pub async fn renew_lock(&self, handle: &LockHandle, ttl_seconds: u64) -> StoreResult<DateTime<Utc>> {
        let expires_at = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            UPDATE orchestrator_locks
            SET expires_at = NOW() + ($3 || ' seconds')::INTERVAL
            WHERE name = $1 AND token = $2 AND expires_at > NOW()
            RETURNING expires_at
            "#,
        )
        .bind(&handle.name)
        .bind(handle.token)
        .bind(ttl_seconds as i64)
        .fetch_optional(self.pool())
        .await?;

        match expires_at {
            Some(expires_at) => Ok(expires_at),
            None => {
                let mut tx = self.pool().begin().await?;
                audit::record(
                    &mut tx,
                    AuditEventType::LeaderRenewFailed,
                    &handle.name,
                    serde_json::json!({ "holder": handle.holder }),
                )
                .await?;
                tx.commit().await?;
                Err(StoreError::Expired)
            }
        }
    }

    /// Voluntary step-down. Only the token holder's row is deleted, so a
    /// release racing a steal is harmless.
    pub async fn release_lock(&self, handle: &LockHandle) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;

        let deleted = sqlx::query("DELETE FROM orchestrator_locks WHERE name = $1 AND token = $2")
            .bind(&handle.name)
            .bind(handle.token)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if deleted > 0 {
            audit::record(
                &mut tx,
                AuditEventType::LeaderReleased,
                &handle.name,
                serde_json::json!({ "holder": handle.holder }),
            )
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    /// Current live holder of the named lock, if any.
    pub async fn lock_holder(&self, name: &str) -> StoreResult<Option<String>> {
        let holder = sqlx::query_scalar::<_, String>(
            "SELECT holder FROM orchestrator_locks WHERE name = $1 AND expires_at > NOW()",
        )
        .bind(name)
        .fetch_optional(self.pool())
        .await?;

        Ok(holder)
    }
}
