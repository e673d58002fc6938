//! Insight and evidence persistence.
//!
//! An insight is the durable analyst-facing summary of one investigation,
//! keyed by a deterministic idempotency key so a re-run replaces content
//! instead of duplicating rows. Evidence rows belong to an insight and
//! are replaced as a set on upsert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::Severity;

/// One row of the `insights` table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InsightRecord {
    /// Primary key.
    pub id: Uuid,
    /// Owning investigation.
    pub investigation_id: Uuid,
    /// Transaction the insight is about.
    pub transaction_id: String,
    /// Final severity.
    pub severity: Severity,
    /// Analyst-facing summary.
    pub summary: String,
    /// Evidence kind marker (fixed: "agentic_investigation").
    pub evidence_kind: String,
    /// Model mode the run used ("llm" or "fallback").
    pub model_mode: String,
    /// Deterministic dedup key.
    pub idempotency_key: String,
    /// When first created.
    pub created_at: DateTime<Utc>,
    /// When last replaced.
    pub updated_at: DateTime<Utc>,
}

/// One row of the `evidence` table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EvidenceRecord {
    /// Primary key.
    pub id: Uuid,
    /// Owning insight.
    pub insight_id: Uuid,
    /// Evidence category.
    pub category: String,
    /// Tool that produced it.
    pub tool: String,
    /// One-line description.
    pub description: String,
    /// Structured payload.
    pub payload: serde_json::Value,
    /// Insertion order key.
    pub created_at: DateTime<Utc>,
}

/// Repository for insights and their evidence.
#[async_trait]
pub trait InsightRepo: Send + Sync {
    /// Upsert by idempotency key. Returns the canonical insight id (the
    /// existing row's id when the key already exists).
    async fn upsert_insight(&self, insight: &InsightRecord) -> Result<Uuid, StoreError>;

    /// Replace the evidence set for an insight.
    async fn replace_evidence(
        &self,
        insight_id: Uuid,
        evidence: &[EvidenceRecord],
    ) -> Result<(), StoreError>;

    /// List insights for a transaction, newest first.
    async fn list_for_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Vec<InsightRecord>, StoreError>;

    /// List evidence for an insight ordered by `created_at`.
    async fn list_evidence(&self, insight_id: Uuid) -> Result<Vec<EvidenceRecord>, StoreError>;
}

/// Postgres-backed implementation.
#[derive(Debug, Clone)]
pub struct PgInsightRepo {
    pool: PgPool,
}

impl PgInsightRepo {
    /// Create a repository over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_insight(row: &sqlx::postgres::PgRow) -> Result<InsightRecord, StoreError> {
    let severity_str: String = row.try_get("severity")?;
    Ok(InsightRecord {
        id: row.try_get("id")?,
        investigation_id: row.try_get("investigation_id")?,
        transaction_id: row.try_get("transaction_id")?,
        severity: Severity::parse(&severity_str).unwrap_or(Severity::Low),
        summary: row.try_get("summary")?,
        evidence_kind: row.try_get("evidence_kind")?,
        model_mode: row.try_get("model_mode")?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl InsightRepo for PgInsightRepo {
    async fn upsert_insight(&self, insight: &InsightRecord) -> Result<Uuid, StoreError> {
        let row = sqlx::query(
            "INSERT INTO ops_agent.insights \
             (id, investigation_id, transaction_id, severity, summary, evidence_kind, \
              model_mode, idempotency_key, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now(), now()) \
             ON CONFLICT (idempotency_key) DO UPDATE SET \
                 investigation_id = EXCLUDED.investigation_id, \
                 severity = EXCLUDED.severity, \
                 summary = EXCLUDED.summary, \
                 model_mode = EXCLUDED.model_mode, \
                 updated_at = now() \
             RETURNING id",
        )
        .bind(insight.id)
        .bind(insight.investigation_id)
        .bind(&insight.transaction_id)
        .bind(insight.severity.as_str())
        .bind(&insight.summary)
        .bind(&insight.evidence_kind)
        .bind(&insight.model_mode)
        .bind(&insight.idempotency_key)
        .fetch_one(&self.pool)
        .await?;
        let id: Uuid = row.try_get("id")?;
        Ok(id)
    }

    async fn replace_evidence(
        &self,
        insight_id: Uuid,
        evidence: &[EvidenceRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM ops_agent.evidence WHERE insight_id = $1")
            .bind(insight_id)
            .execute(&mut *tx)
            .await?;
        for record in evidence {
            sqlx::query(
                "INSERT INTO ops_agent.evidence \
                 (id, insight_id, category, tool, description, payload, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(record.id)
            .bind(insight_id)
            .bind(&record.category)
            .bind(&record.tool)
            .bind(&record.description)
            .bind(&record.payload)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_for_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Vec<InsightRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, investigation_id, transaction_id, severity, summary, evidence_kind, \
                    model_mode, idempotency_key, created_at, updated_at \
             FROM ops_agent.insights \
             WHERE transaction_id = $1 \
             ORDER BY updated_at DESC",
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_insight).collect()
    }

    async fn list_evidence(&self, insight_id: Uuid) -> Result<Vec<EvidenceRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, insight_id, category, tool, description, payload, created_at \
             FROM ops_agent.evidence \
             WHERE insight_id = $1 \
             ORDER BY created_at, id",
        )
        .bind(insight_id)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(EvidenceRecord {
                id: row.try_get("id")?,
                insight_id: row.try_get("insight_id")?,
                category: row.try_get("category")?,
                tool: row.try_get("tool")?,
                description: row.try_get("description")?,
                payload: row.try_get("payload")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(records)
    }
}
