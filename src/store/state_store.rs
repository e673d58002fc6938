//! Versioned JSONB state snapshots.
//!
//! Exactly one row per investigation; every write strictly increments
//! `version` in a single atomic upsert, so concurrent writers can never
//! produce the same version twice.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::InvestigationState;

/// Store for versioned state snapshots.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Upsert the snapshot and return the new version (1 on first write).
    async fn save_state(
        &self,
        investigation_id: Uuid,
        state: &InvestigationState,
    ) -> Result<i64, StoreError>;

    /// Load the latest snapshot, if any.
    async fn load_state(
        &self,
        investigation_id: Uuid,
    ) -> Result<Option<InvestigationState>, StoreError>;

    /// Delete the snapshot. Returns whether a row existed.
    async fn delete_state(&self, investigation_id: Uuid) -> Result<bool, StoreError>;

    /// Delete snapshots older than the retention window. Returns the
    /// number of rows removed.
    async fn prune_expired(&self, retention_days: u32) -> Result<u64, StoreError>;
}

/// Postgres-backed implementation.
#[derive(Debug, Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    /// Create a store over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn save_state(
        &self,
        investigation_id: Uuid,
        state: &InvestigationState,
    ) -> Result<i64, StoreError> {
        let payload = serde_json::to_value(state)?;
        let row = sqlx::query(
            "INSERT INTO ops_agent.investigation_state \
             (investigation_id, state, version, created_at, updated_at) \
             VALUES ($1, $2, 1, now(), now()) \
             ON CONFLICT (investigation_id) DO UPDATE SET \
                 state = EXCLUDED.state, \
                 version = ops_agent.investigation_state.version + 1, \
                 updated_at = now() \
             RETURNING version",
        )
        .bind(investigation_id)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;
        let version: i32 = row.try_get("version")?;
        Ok(i64::from(version))
    }

    async fn load_state(
        &self,
        investigation_id: Uuid,
    ) -> Result<Option<InvestigationState>, StoreError> {
        let row = sqlx::query(
            "SELECT state FROM ops_agent.investigation_state WHERE investigation_id = $1",
        )
        .bind(investigation_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let payload: serde_json::Value = row.try_get("state")?;
                let state: InvestigationState = serde_json::from_value(payload)?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn delete_state(&self, investigation_id: Uuid) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM ops_agent.investigation_state WHERE investigation_id = $1")
                .bind(investigation_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn prune_expired(&self, retention_days: u32) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM ops_agent.investigation_state \
             WHERE updated_at < now() - make_interval(days => $1)",
        )
        .bind(i32::try_from(retention_days).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
