//! Rule draft persistence.
//!
//! A draft is a first-class artifact owned by its investigation. Export to
//! rule management is a separate, human-gated action; this repository only
//! tracks the draft and its export status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::RuleDraftPayload;

/// Export status of a rule draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleDraftStatus {
    /// Awaiting human review.
    Pending,
    /// Handed to rule management.
    Exported,
    /// Export attempt failed.
    Failed,
}

impl RuleDraftStatus {
    /// Stable string form used in persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Exported => "EXPORTED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse from the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "EXPORTED" => Some(Self::Exported),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One row of the `rule_drafts` table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RuleDraftRecord {
    /// Primary key.
    pub id: Uuid,
    /// Owning investigation.
    pub investigation_id: Uuid,
    /// Export status.
    pub status: RuleDraftStatus,
    /// The draft payload.
    pub payload: RuleDraftPayload,
    /// When first created.
    pub created_at: DateTime<Utc>,
    /// When last changed.
    pub updated_at: DateTime<Utc>,
}

/// Repository for rule drafts.
#[async_trait]
pub trait RuleDraftRepo: Send + Sync {
    /// Insert or replace the draft for an investigation.
    async fn upsert(&self, record: &RuleDraftRecord) -> Result<(), StoreError>;

    /// Fetch the draft for an investigation, if present.
    async fn get_for_investigation(
        &self,
        investigation_id: Uuid,
    ) -> Result<Option<RuleDraftRecord>, StoreError>;

    /// Update the export status.
    async fn set_status(&self, id: Uuid, status: RuleDraftStatus) -> Result<(), StoreError>;
}

/// Postgres-backed implementation.
#[derive(Debug, Clone)]
pub struct PgRuleDraftRepo {
    pool: PgPool,
}

impl PgRuleDraftRepo {
    /// Create a repository over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RuleDraftRepo for PgRuleDraftRepo {
    async fn upsert(&self, record: &RuleDraftRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_value(&record.payload)?;
        // One draft per investigation: remove a stale one, then insert.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM ops_agent.rule_drafts WHERE investigation_id = $1")
            .bind(record.investigation_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO ops_agent.rule_drafts \
             (id, investigation_id, status, payload, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, now(), now())",
        )
        .bind(record.id)
        .bind(record.investigation_id)
        .bind(record.status.as_str())
        .bind(payload)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_for_investigation(
        &self,
        investigation_id: Uuid,
    ) -> Result<Option<RuleDraftRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, investigation_id, status, payload, created_at, updated_at \
             FROM ops_agent.rule_drafts WHERE investigation_id = $1",
        )
        .bind(investigation_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let status_str: String = row.try_get("status")?;
                let payload_value: serde_json::Value = row.try_get("payload")?;
                let payload: RuleDraftPayload = serde_json::from_value(payload_value)?;
                Ok(Some(RuleDraftRecord {
                    id: row.try_get("id")?,
                    investigation_id: row.try_get("investigation_id")?,
                    status: RuleDraftStatus::parse(&status_str)
                        .unwrap_or(RuleDraftStatus::Pending),
                    payload,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn set_status(&self, id: Uuid, status: RuleDraftStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE ops_agent.rule_drafts SET status = $1, updated_at = now() WHERE id = $2",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("rule draft {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            RuleDraftStatus::Pending,
            RuleDraftStatus::Exported,
            RuleDraftStatus::Failed,
        ] {
            assert_eq!(RuleDraftStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RuleDraftStatus::parse("bogus"), None);
    }
}
