//! Investigation lifecycle rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::{InvestigationMode, InvestigationStatus, Severity};

/// One row of the `investigations` table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Investigation {
    /// Primary key.
    pub id: Uuid,
    /// External transaction identifier being investigated.
    pub transaction_id: String,
    /// Execution mode.
    pub mode: InvestigationMode,
    /// Lifecycle status.
    pub status: InvestigationStatus,
    /// Final severity; set at completion.
    pub severity: Option<Severity>,
    /// Final confidence; set at completion.
    pub final_confidence: Option<f64>,
    /// Planner steps taken.
    pub step_count: u32,
    /// Step cap for this run.
    pub max_steps: u32,
    /// Planner model identifier.
    pub planner_model: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Repository for investigation rows.
#[async_trait]
pub trait InvestigationRepo: Send + Sync {
    /// Insert a new investigation row.
    async fn create(&self, investigation: &Investigation) -> Result<(), StoreError>;

    /// Fetch by id.
    async fn get(&self, id: Uuid) -> Result<Option<Investigation>, StoreError>;

    /// Find a PENDING or IN_PROGRESS investigation for a transaction, used
    /// for duplicate-request conflict detection.
    async fn find_active_for_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Investigation>, StoreError>;

    /// Flip the status (PENDING -> IN_PROGRESS on first planner call).
    async fn set_status(&self, id: Uuid, status: InvestigationStatus) -> Result<(), StoreError>;

    /// Write the terminal fields. This update must succeed for a run to be
    /// considered persisted.
    async fn finalize(
        &self,
        id: Uuid,
        status: InvestigationStatus,
        severity: Severity,
        final_confidence: f64,
        step_count: u32,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Delete the investigation and, by cascade, everything it owns.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
}

/// Postgres-backed implementation.
#[derive(Debug, Clone)]
pub struct PgInvestigationRepo {
    pool: PgPool,
}

impl PgInvestigationRepo {
    /// Create a repository over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_investigation(row: &sqlx::postgres::PgRow) -> Result<Investigation, StoreError> {
    let mode_str: String = row.try_get("mode")?;
    let status_str: String = row.try_get("status")?;
    let severity_str: Option<String> = row.try_get("severity")?;
    let step_count: i32 = row.try_get("step_count")?;
    let max_steps: i32 = row.try_get("max_steps")?;

    Ok(Investigation {
        id: row.try_get("id")?,
        transaction_id: row.try_get("transaction_id")?,
        mode: InvestigationMode::parse(&mode_str)
            .ok_or_else(|| StoreError::Serialization(format!("unknown mode {mode_str}")))?,
        status: InvestigationStatus::parse(&status_str)
            .ok_or_else(|| StoreError::Serialization(format!("unknown status {status_str}")))?,
        severity: severity_str.as_deref().and_then(Severity::parse),
        final_confidence: row.try_get("final_confidence")?,
        step_count: u32::try_from(step_count).unwrap_or(0),
        max_steps: u32::try_from(max_steps).unwrap_or(0),
        planner_model: row.try_get("planner_model")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

const SELECT_COLUMNS: &str = "id, transaction_id, mode, status, severity, final_confidence, \
     step_count, max_steps, planner_model, started_at, completed_at";

#[async_trait]
impl InvestigationRepo for PgInvestigationRepo {
    async fn create(&self, investigation: &Investigation) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO ops_agent.investigations \
             (id, transaction_id, mode, status, severity, final_confidence, step_count, \
              max_steps, planner_model, started_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(investigation.id)
        .bind(&investigation.transaction_id)
        .bind(investigation.mode.as_str())
        .bind(investigation.status.as_str())
        .bind(investigation.severity.map(Severity::as_str))
        .bind(investigation.final_confidence)
        .bind(i32::try_from(investigation.step_count).unwrap_or(i32::MAX))
        .bind(i32::try_from(investigation.max_steps).unwrap_or(i32::MAX))
        .bind(&investigation.planner_model)
        .bind(investigation.started_at)
        .bind(investigation.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Investigation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM ops_agent.investigations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_investigation).transpose()
    }

    async fn find_active_for_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Investigation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM ops_agent.investigations \
             WHERE transaction_id = $1 AND status IN ('PENDING', 'IN_PROGRESS') \
             ORDER BY started_at DESC LIMIT 1"
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_investigation).transpose()
    }

    async fn set_status(&self, id: Uuid, status: InvestigationStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE ops_agent.investigations SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("investigation {id}")));
        }
        Ok(())
    }

    async fn finalize(
        &self,
        id: Uuid,
        status: InvestigationStatus,
        severity: Severity,
        final_confidence: f64,
        step_count: u32,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE ops_agent.investigations \
             SET status = $1, severity = $2, final_confidence = $3, step_count = $4, \
                 completed_at = $5 \
             WHERE id = $6",
        )
        .bind(status.as_str())
        .bind(severity.as_str())
        .bind(final_confidence)
        .bind(i32::try_from(step_count).unwrap_or(i32::MAX))
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("investigation {id}")));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM ops_agent.investigations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
