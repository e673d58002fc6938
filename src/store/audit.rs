//! Append-only audit log.
//!
//! Rows are never updated after insert. Lifecycle events, severity
//! escalations, recommendation actions, and dependency failures during
//! completion all land here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::error::StoreError;

/// One append-only audit entry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditEntry {
    /// Entity type (e.g. "investigation", "recommendation").
    pub entity_type: String,
    /// Entity identifier as text.
    pub entity_id: String,
    /// Action recorded (e.g. "completed", "severity_escalated").
    pub action: String,
    /// Actor ("ops-agent" for the runtime, a user id for analyst actions).
    pub performed_by: String,
    /// Structured detail payload.
    pub new_value: serde_json::Value,
    /// When the action happened.
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Build an entry performed by the runtime itself, stamped now.
    pub fn system(
        entity_type: &str,
        entity_id: &str,
        action: &str,
        new_value: serde_json::Value,
    ) -> Self {
        Self {
            entity_type: entity_type.to_owned(),
            entity_id: entity_id.to_owned(),
            action: action.to_owned(),
            performed_by: "ops-agent".to_owned(),
            new_value,
            created_at: Utc::now(),
        }
    }
}

/// Append-only audit repository.
#[async_trait]
pub trait AuditRepo: Send + Sync {
    /// Append one entry.
    async fn append(&self, entry: &AuditEntry) -> Result<(), StoreError>;

    /// List entries for an entity in insertion order.
    async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditEntry>, StoreError>;
}

/// Postgres-backed implementation.
#[derive(Debug, Clone)]
pub struct PgAuditRepo {
    pool: PgPool,
}

impl PgAuditRepo {
    /// Create a repository over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditRepo for PgAuditRepo {
    async fn append(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO ops_agent.audit_log \
             (entity_type, entity_id, action, performed_by, new_value, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.action)
        .bind(&entry.performed_by)
        .bind(&entry.new_value)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT entity_type, entity_id, action, performed_by, new_value, created_at \
             FROM ops_agent.audit_log \
             WHERE entity_type = $1 AND entity_id = $2 \
             ORDER BY id",
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(AuditEntry {
                entity_type: row.try_get("entity_type")?,
                entity_id: row.try_get("entity_id")?,
                action: row.try_get("action")?,
                performed_by: row.try_get("performed_by")?,
                new_value: row.try_get("new_value")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(entries)
    }
}
