//! Append-only tool execution log.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::{ToolExecution, ToolStatus};

/// Append-only log of tool executions, one row per execution.
#[async_trait]
pub trait ToolLogRepo: Send + Sync {
    /// Insert one row per execution record.
    async fn append_batch(
        &self,
        investigation_id: Uuid,
        executions: &[ToolExecution],
    ) -> Result<(), StoreError>;

    /// List executions for an investigation in step order.
    async fn list(&self, investigation_id: Uuid) -> Result<Vec<ToolExecution>, StoreError>;
}

/// Postgres-backed implementation.
#[derive(Debug, Clone)]
pub struct PgToolLogRepo {
    pool: PgPool,
}

impl PgToolLogRepo {
    /// Create a repository over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ToolLogRepo for PgToolLogRepo {
    async fn append_batch(
        &self,
        investigation_id: Uuid,
        executions: &[ToolExecution],
    ) -> Result<(), StoreError> {
        for execution in executions {
            sqlx::query(
                "INSERT INTO ops_agent.tool_execution_log \
                 (investigation_id, tool_name, step_number, status, input_summary, \
                  output_summary, execution_time_ms, error_message, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(investigation_id)
            .bind(&execution.tool_name)
            .bind(i32::try_from(execution.step_number).unwrap_or(i32::MAX))
            .bind(execution.status.as_str())
            .bind(&execution.input_summary)
            .bind(&execution.output_summary)
            .bind(i64::try_from(execution.execution_time_ms).unwrap_or(i64::MAX))
            .bind(&execution.error_message)
            .bind(execution.timestamp)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn list(&self, investigation_id: Uuid) -> Result<Vec<ToolExecution>, StoreError> {
        let rows = sqlx::query(
            "SELECT tool_name, step_number, status, input_summary, output_summary, \
                    execution_time_ms, error_message, created_at \
             FROM ops_agent.tool_execution_log \
             WHERE investigation_id = $1 \
             ORDER BY step_number, id",
        )
        .bind(investigation_id)
        .fetch_all(&self.pool)
        .await?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            let status_str: String = row.try_get("status")?;
            let status = match status_str.as_str() {
                "SUCCESS" => ToolStatus::Success,
                "TIMED_OUT" => ToolStatus::TimedOut,
                _ => ToolStatus::Failed,
            };
            let step_number: i32 = row.try_get("step_number")?;
            let execution_time_ms: i64 = row.try_get("execution_time_ms")?;
            executions.push(ToolExecution {
                tool_name: row.try_get("tool_name")?,
                step_number: u32::try_from(step_number).unwrap_or(0),
                status,
                input_summary: row.try_get("input_summary")?,
                output_summary: row.try_get("output_summary")?,
                execution_time_ms: u64::try_from(execution_time_ms).unwrap_or(0),
                error_message: row.try_get("error_message")?,
                timestamp: row.try_get("created_at")?,
            });
        }
        Ok(executions)
    }
}
