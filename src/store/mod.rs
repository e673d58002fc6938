//! Persistence layer: repositories over a dedicated Postgres schema.
//!
//! Every repository is a trait with two implementations: a `Pg*` type
//! backed by `sqlx`, and a `Memory*` type used by tests and offline runs.
//! All mutation paths use parameterized queries; nothing interpolates
//! caller input into SQL text.

use std::str::FromStr;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use crate::config::DatabaseSettings;
use crate::error::StoreError;

pub mod audit;
pub mod embeddings;
pub mod insights;
pub mod investigations;
pub mod memory;
pub mod recommendations;
pub mod rule_drafts;
pub mod state_store;
pub mod tool_log;

pub use audit::{AuditEntry, AuditRepo, PgAuditRepo};
pub use embeddings::{EmbeddingIndex, NeighborHit, PgEmbeddingIndex};
pub use insights::{EvidenceRecord, InsightRecord, InsightRepo, PgInsightRepo};
pub use investigations::{Investigation, InvestigationRepo, PgInvestigationRepo};
pub use recommendations::{
    PgRecommendationRepo, RecommendationRecord, RecommendationRepo, RecommendationStatus,
    WorklistCursor, WorklistFilter,
};
pub use rule_drafts::{PgRuleDraftRepo, RuleDraftRecord, RuleDraftRepo, RuleDraftStatus};
pub use state_store::{PgStateStore, StateStore};
pub use tool_log::{PgToolLogRepo, ToolLogRepo};

/// Placeholder in [`SCHEMA_TEMPLATE`] replaced with the configured vector
/// dimension.
const DIM_PLACEHOLDER: &str = "__VECTOR_DIM__";

/// DDL for the dedicated schema. Idempotent.
const SCHEMA_TEMPLATE: &str = r#"
CREATE SCHEMA IF NOT EXISTS ops_agent;
CREATE EXTENSION IF NOT EXISTS vector;

CREATE TABLE IF NOT EXISTS ops_agent.investigations (
    id              UUID PRIMARY KEY,
    transaction_id  TEXT NOT NULL,
    mode            TEXT NOT NULL,
    status          TEXT NOT NULL,
    severity        TEXT,
    final_confidence DOUBLE PRECISION,
    step_count      INTEGER NOT NULL DEFAULT 0,
    max_steps       INTEGER NOT NULL,
    planner_model   TEXT NOT NULL,
    started_at      TIMESTAMPTZ NOT NULL,
    completed_at    TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_investigations_transaction
    ON ops_agent.investigations (transaction_id, status);

CREATE TABLE IF NOT EXISTS ops_agent.investigation_state (
    investigation_id UUID PRIMARY KEY
        REFERENCES ops_agent.investigations(id) ON DELETE CASCADE,
    state           JSONB NOT NULL,
    version         INTEGER NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS ops_agent.tool_execution_log (
    id              BIGSERIAL PRIMARY KEY,
    investigation_id UUID NOT NULL
        REFERENCES ops_agent.investigations(id) ON DELETE CASCADE,
    tool_name       TEXT NOT NULL,
    step_number     INTEGER NOT NULL,
    status          TEXT NOT NULL,
    input_summary   TEXT NOT NULL,
    output_summary  TEXT NOT NULL,
    execution_time_ms BIGINT NOT NULL,
    error_message   TEXT,
    created_at      TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tool_log_investigation
    ON ops_agent.tool_execution_log (investigation_id, step_number);

CREATE TABLE IF NOT EXISTS ops_agent.insights (
    id              UUID PRIMARY KEY,
    investigation_id UUID NOT NULL
        REFERENCES ops_agent.investigations(id) ON DELETE CASCADE,
    transaction_id  TEXT NOT NULL,
    severity        TEXT NOT NULL,
    summary         TEXT NOT NULL,
    evidence_kind   TEXT NOT NULL,
    model_mode      TEXT NOT NULL,
    idempotency_key TEXT NOT NULL UNIQUE,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_insights_transaction
    ON ops_agent.insights (transaction_id);

CREATE TABLE IF NOT EXISTS ops_agent.evidence (
    id              UUID PRIMARY KEY,
    insight_id      UUID NOT NULL
        REFERENCES ops_agent.insights(id) ON DELETE CASCADE,
    category        TEXT NOT NULL,
    tool            TEXT NOT NULL,
    description     TEXT NOT NULL,
    payload         JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_evidence_insight
    ON ops_agent.evidence (insight_id, created_at);

CREATE TABLE IF NOT EXISTS ops_agent.recommendations (
    id              UUID PRIMARY KEY,
    insight_id      UUID NOT NULL
        REFERENCES ops_agent.insights(id) ON DELETE CASCADE,
    rec_type        TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'OPEN',
    severity        TEXT NOT NULL,
    priority        INTEGER NOT NULL,
    title           TEXT NOT NULL,
    impact          TEXT NOT NULL,
    payload         JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_recommendations_worklist
    ON ops_agent.recommendations (status, created_at DESC);

CREATE TABLE IF NOT EXISTS ops_agent.rule_drafts (
    id              UUID PRIMARY KEY,
    investigation_id UUID NOT NULL
        REFERENCES ops_agent.investigations(id) ON DELETE CASCADE,
    status          TEXT NOT NULL DEFAULT 'PENDING',
    payload         JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_rule_drafts_investigation
    ON ops_agent.rule_drafts (investigation_id);

CREATE TABLE IF NOT EXISTS ops_agent.audit_log (
    id              BIGSERIAL PRIMARY KEY,
    entity_type     TEXT NOT NULL,
    entity_id       TEXT NOT NULL,
    action          TEXT NOT NULL,
    performed_by    TEXT NOT NULL,
    new_value       JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_entity
    ON ops_agent.audit_log (entity_type, entity_id);

CREATE TABLE IF NOT EXISTS ops_agent.transaction_embeddings (
    transaction_id  TEXT PRIMARY KEY,
    summary         TEXT NOT NULL,
    embedding       vector(__VECTOR_DIM__) NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

/// Open a connection pool with a server-side statement timeout.
///
/// # Errors
///
/// Returns an error if the URL is invalid or the database is unreachable.
pub async fn connect(settings: &DatabaseSettings) -> Result<PgPool, StoreError> {
    let options = PgConnectOptions::from_str(&settings.url)
        .map_err(|e| StoreError::Database(e.to_string()))?
        .options([(
            "statement_timeout",
            format!("{}s", settings.statement_timeout_seconds),
        )]);

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Apply the schema DDL. Idempotent; safe to run at every startup.
///
/// # Errors
///
/// Returns an error if any DDL statement fails.
pub async fn apply_schema(pool: &PgPool, vector_dimension: u32) -> Result<(), StoreError> {
    let ddl = SCHEMA_TEMPLATE.replace(DIM_PLACEHOLDER, &vector_dimension.to_string());
    sqlx::raw_sql(&ddl).execute(pool).await?;
    Ok(())
}
