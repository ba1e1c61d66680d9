//! GPU/CPU lease table.
//!
//! A lease is a time-bounded reservation held by a named agent. Activity is
//! `released_at IS NULL AND expires_at > NOW()`; a partial unique index on
//! (agent, device_index) over unreleased rows backs the conflict check under
//! concurrent grants.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::audit::{self, AuditEventType};
use super::{Store, StoreError, StoreResult};
use crate::common::ids;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(type_name = "lease_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LeaseMode {
    Gpu,
    Cpu,
}

/// A granted reservation.
#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Lease {
    pub token: Uuid,
    pub agent: String,
    pub device_index: Option<i32>,
    pub mode: LeaseMode,
    pub pool_id: Option<Uuid>,
    pub model_id: Option<String>,
    pub ttl_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

impl Lease {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.released_at.is_none() && self.expires_at > now
    }
}

const LEASE_COLUMNS: &str = "token, agent, device_index, mode, pool_id, model_id, ttl_seconds, \
                             created_at, expires_at, last_heartbeat_at, released_at, metadata";

/// Parameters for a new lease.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct LeaseSpec {
    pub agent: String,
    #[builder(default, setter(strip_option))]
    pub device_index: Option<i32>,
    pub mode: LeaseMode,
    pub ttl_seconds: i64,
    #[builder(default, setter(strip_option))]
    pub pool_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub model_id: Option<String>,
    #[builder(default = serde_json::json!({}))]
    pub metadata: serde_json::Value,
}

impl Store {
    /// Grant a lease.
    ///
    /// Single transaction: lazily expire stale rows for the slot, verify no
    /// active lease holds (agent, device), insert with the TTL clamped to
    /// the policy maximum, audit. Concurrent grants racing past the probe
    /// are caught by the partial unique index and surface as `Conflict`.
    pub async fn put_lease(&self, spec: &LeaseSpec) -> StoreResult<Lease> {
        let ttl = (spec.ttl_seconds.max(1) as u64).min(self.policy().max_lease_ttl_seconds) as i64;
        let mut tx = self.pool().begin().await?;

        if let Some(device) = spec.device_index {
            // Expired-but-unpurged rows must not block the slot.
            let stale = sqlx::query_scalar::<_, Uuid>(
                r#"
                UPDATE orchestrator_leases
                SET released_at = NOW()
                WHERE agent = $1 AND device_index = $2
                  AND released_at IS NULL AND expires_at <= NOW()
                RETURNING token
                "#,
            )
            .bind(&spec.agent)
            .bind(device)
            .fetch_all(&mut *tx)
            .await?;
            for token in stale {
                audit::record(
                    &mut tx,
                    AuditEventType::LeaseExpired,
                    &token.to_string(),
                    serde_json::json!({ "agent": spec.agent, "device_index": device }),
                )
                .await?;
            }

            let held = sqlx::query_scalar::<_, i64>(
                r#"
                SELECT COUNT(*) FROM orchestrator_leases
                WHERE agent = $1 AND device_index = $2 AND released_at IS NULL
                "#,
            )
            .bind(&spec.agent)
            .bind(device)
            .fetch_one(&mut *tx)
            .await?;
            if held > 0 {
                return Err(StoreError::Conflict(format!(
                    "agent '{}' already holds a lease on device {}",
                    spec.agent, device
                )));
            }
        }

        let token = ids::new_id();
        let lease = sqlx::query_as::<_, Lease>(&format!(
            r#"
            INSERT INTO orchestrator_leases
                (token, agent, device_index, mode, pool_id, model_id, ttl_seconds,
                 created_at, expires_at, last_heartbeat_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7,
                    NOW(), NOW() + ($7 || ' seconds')::INTERVAL, NOW(), $8)
            RETURNING {LEASE_COLUMNS}
            "#
        ))
        .bind(token)
        .bind(&spec.agent)
        .bind(spec.device_index)
        .bind(spec.mode)
        .bind(spec.pool_id)
        .bind(&spec.model_id)
        .bind(ttl)
        .bind(&spec.metadata)
        .fetch_one(&mut *tx)
        .await?;

        audit::record(
            &mut tx,
            AuditEventType::LeaseGranted,
            &token.to_string(),
            serde_json::json!({
                "agent": spec.agent,
                "device_index": spec.device_index,
                "mode": spec.mode,
                "ttl_seconds": ttl,
            }),
        )
        .await?;
        tx.commit().await?;

        Ok(lease)
    }

    /// Heartbeat: refresh `last_heartbeat_at` and push the expiry forward,
    /// never past `created_at + max_lease_ttl_seconds`.
    ///
    /// A heartbeat arriving at or after the expiry is `Expired` — the
    /// boundary itself rejects, so a reclaimed lease can never be revived.
    pub async fn extend_lease(&self, token: Uuid) -> StoreResult<Lease> {
        let max_ttl = self.policy().max_lease_ttl_seconds as i64;
        let mut tx = self.pool().begin().await?;

        let extended = sqlx::query_as::<_, Lease>(&format!(
            r#"
            UPDATE orchestrator_leases
            SET last_heartbeat_at = GREATEST(last_heartbeat_at, NOW()),
                expires_at = LEAST(
                    created_at + ($2 || ' seconds')::INTERVAL,
                    NOW() + (ttl_seconds || ' seconds')::INTERVAL
                )
            WHERE token = $1
              AND released_at IS NULL
              AND expires_at > NOW()
              AND created_at + ($2 || ' seconds')::INTERVAL > NOW()
            RETURNING {LEASE_COLUMNS}
            "#
        ))
        .bind(token)
        .bind(max_ttl)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(lease) = extended else {
            let exists = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM orchestrator_leases WHERE token = $1",
            )
            .bind(token)
            .fetch_one(&mut *tx)
            .await?;
            tx.rollback().await?;
            return Err(if exists > 0 {
                StoreError::Expired
            } else {
                StoreError::Unknown
            });
        };

        audit::record(
            &mut tx,
            AuditEventType::LeaseExtended,
            &token.to_string(),
            serde_json::json!({ "expires_at": lease.expires_at }),
        )
        .await?;
        tx.commit().await?;

        Ok(lease)
    }

    /// Idempotent release. Unknown tokens surface; re-releasing is a no-op.
    pub async fn release_lease(&self, token: Uuid) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;

        let released = sqlx::query(
            r#"
            UPDATE orchestrator_leases
            SET released_at = NOW()
            WHERE token = $1 AND released_at IS NULL
            "#,
        )
        .bind(token)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if released == 0 {
            let exists = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM orchestrator_leases WHERE token = $1",
            )
            .bind(token)
            .fetch_one(&mut *tx)
            .await?;
            tx.rollback().await?;
            return if exists > 0 {
                Ok(())
            } else {
                Err(StoreError::Unknown)
            };
        }

        audit::record(
            &mut tx,
            AuditEventType::LeaseReleased,
            &token.to_string(),
            serde_json::json!({}),
        )
        .await?;
        tx.commit().await?;

        Ok(())
    }

    /// Mark every lease whose expiry has passed. Live work is not revoked;
    /// the holder finds out at its next heartbeat.
    pub async fn purge_expired_leases(&self) -> StoreResult<Vec<Uuid>> {
        let mut tx = self.pool().begin().await?;

        let expired = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE orchestrator_leases
            SET released_at = NOW()
            WHERE released_at IS NULL AND expires_at <= NOW()
            RETURNING token
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        for token in &expired {
            audit::record(
                &mut tx,
                AuditEventType::LeaseExpired,
                &token.to_string(),
                serde_json::json!({}),
            )
            .await?;
        }
        tx.commit().await?;

        Ok(expired)
    }

    pub async fn find_lease(&self, token: Uuid) -> StoreResult<Option<Lease>> {
        let lease = sqlx::query_as::<_, Lease>(&format!(
            "SELECT {LEASE_COLUMNS} FROM orchestrator_leases WHERE token = $1"
        ))
        .bind(token)
        .fetch_optional(self.pool())
        .await?;

        Ok(lease)
    }

    pub async fn count_active_leases(&self) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM orchestrator_leases
            WHERE released_at IS NULL AND expires_at > NOW()
            "#,
        )
        .fetch_one(self.pool())
        .await?;

        Ok(count)
    }

    /// Active lease count per device, for the selection ranking.
    pub async fn active_lease_counts_by_device(&self) -> StoreResult<Vec<(i32, i64)>> {
        let rows = sqlx::query_as::<_, (i32, i64)>(
            r#"
            SELECT device_index, COUNT(*) FROM orchestrator_leases
            WHERE released_at IS NULL AND expires_at > NOW() AND device_index IS NOT NULL
            GROUP BY device_index
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    /// Active leases still referencing a pool (drain gate).
    pub async fn active_lease_count_for_pool(&self, pool_id: Uuid) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM orchestrator_leases
            WHERE pool_id = $1 AND released_at IS NULL AND expires_at > NOW()
            "#,
        )
        .bind(pool_id)
        .fetch_one(self.pool())
        .await?;

        Ok(count)
    }
}
