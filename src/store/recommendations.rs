//! Recommendation worklist persistence.
//!
//! Status transitions are a small fixed machine: `OPEN -> ACKNOWLEDGED`,
//! `OPEN -> REJECTED`, `ACKNOWLEDGED -> EXPORTED`. `REJECTED` and
//! `EXPORTED` are terminal. The guarded update is a compare-and-swap on
//! the expected current status, so lost updates are impossible.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::Severity;

/// Lifecycle status of a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationStatus {
    /// Awaiting analyst action.
    Open,
    /// Analyst accepted the recommendation.
    Acknowledged,
    /// Analyst rejected it. Terminal.
    Rejected,
    /// Exported to rule management. Terminal.
    Exported,
}

impl RecommendationStatus {
    /// Stable string form used in persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::Rejected => "REJECTED",
            Self::Exported => "EXPORTED",
        }
    }

    /// Parse from the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(Self::Open),
            "ACKNOWLEDGED" => Some(Self::Acknowledged),
            "REJECTED" => Some(Self::Rejected),
            "EXPORTED" => Some(Self::Exported),
            _ => None,
        }
    }

    /// Whether `from -> to` is a permitted transition.
    pub fn transition_allowed(from: Self, to: Self) -> bool {
        matches!(
            (from, to),
            (Self::Open, Self::Acknowledged)
                | (Self::Open, Self::Rejected)
                | (Self::Acknowledged, Self::Exported)
        )
    }
}

/// One row of the `recommendations` table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecommendationRecord {
    /// Primary key.
    pub id: Uuid,
    /// Owning insight.
    pub insight_id: Uuid,
    /// Recommendation type.
    pub kind: String,
    /// Lifecycle status.
    pub status: RecommendationStatus,
    /// Severity inherited from the insight at write time.
    pub severity: Severity,
    /// Priority, 1 is highest.
    pub priority: u32,
    /// Short actionable title.
    pub title: String,
    /// Expected impact description.
    pub impact: String,
    /// Context needed to act without re-querying.
    pub payload: serde_json::Value,
    /// When first created.
    pub created_at: DateTime<Utc>,
    /// When last changed.
    pub updated_at: DateTime<Utc>,
}

/// Worklist filters; all optional and combined with AND.
#[derive(Debug, Clone, Default)]
pub struct WorklistFilter {
    /// Filter by status.
    pub status: Option<RecommendationStatus>,
    /// Filter by severity.
    pub severity: Option<Severity>,
    /// Filter by recommendation type.
    pub kind: Option<String>,
}

/// Keyset cursor: the `(status, created_at)` of the last row seen.
#[derive(Debug, Clone, PartialEq)]
pub struct WorklistCursor {
    /// Status component.
    pub status: String,
    /// Created-at component.
    pub created_at: DateTime<Utc>,
}

impl WorklistCursor {
    /// Encode as an opaque cursor string.
    pub fn encode(&self) -> String {
        format!("{}|{}", self.status, self.created_at.to_rfc3339())
    }

    /// Decode a cursor string produced by [`WorklistCursor::encode`].
    pub fn decode(raw: &str) -> Option<Self> {
        let (status, ts) = raw.split_once('|')?;
        let created_at = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
        Some(Self {
            status: status.to_owned(),
            created_at,
        })
    }
}

/// Repository for recommendation rows.
#[async_trait]
pub trait RecommendationRepo: Send + Sync {
    /// Replace the OPEN recommendations of an insight with a fresh set.
    ///
    /// Rows an analyst has already moved out of OPEN are left untouched;
    /// fresh rows whose type collides with such a row are skipped.
    async fn replace_for_insight(
        &self,
        insight_id: Uuid,
        recommendations: &[RecommendationRecord],
    ) -> Result<(), StoreError>;

    /// Fetch by id.
    async fn get(&self, id: Uuid) -> Result<Option<RecommendationRecord>, StoreError>;

    /// Compare-and-swap status update. Returns false when the row was not
    /// in `expected` status (the update is not applied).
    async fn update_status_with_guard(
        &self,
        id: Uuid,
        new_status: RecommendationStatus,
        expected: RecommendationStatus,
    ) -> Result<bool, StoreError>;

    /// Keyset-paginated worklist, ordered by `(status, created_at)`
    /// descending.
    async fn worklist(
        &self,
        filter: &WorklistFilter,
        cursor: Option<WorklistCursor>,
        limit: u32,
    ) -> Result<Vec<RecommendationRecord>, StoreError>;
}

/// Postgres-backed implementation.
#[derive(Debug, Clone)]
pub struct PgRecommendationRepo {
    pool: PgPool,
}

impl PgRecommendationRepo {
    /// Create a repository over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<RecommendationRecord, StoreError> {
    let status_str: String = row.try_get("status")?;
    let severity_str: String = row.try_get("severity")?;
    let priority: i32 = row.try_get("priority")?;
    Ok(RecommendationRecord {
        id: row.try_get("id")?,
        insight_id: row.try_get("insight_id")?,
        kind: row.try_get("rec_type")?,
        status: RecommendationStatus::parse(&status_str).unwrap_or(RecommendationStatus::Open),
        severity: Severity::parse(&severity_str).unwrap_or(Severity::Low),
        priority: u32::try_from(priority).unwrap_or(0),
        title: row.try_get("title")?,
        impact: row.try_get("impact")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const SELECT_COLUMNS: &str = "id, insight_id, rec_type, status, severity, priority, title, \
     impact, payload, created_at, updated_at";

#[async_trait]
impl RecommendationRepo for PgRecommendationRepo {
    async fn replace_for_insight(
        &self,
        insight_id: Uuid,
        recommendations: &[RecommendationRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM ops_agent.recommendations WHERE insight_id = $1 AND status = 'OPEN'",
        )
        .bind(insight_id)
        .execute(&mut *tx)
        .await?;

        for record in recommendations {
            // Skip kinds the analyst already acted on.
            sqlx::query(
                "INSERT INTO ops_agent.recommendations \
                 (id, insight_id, rec_type, status, severity, priority, title, impact, \
                  payload, created_at, updated_at) \
                 SELECT $1, $2, $3, 'OPEN', $4, $5, $6, $7, $8, now(), now() \
                 WHERE NOT EXISTS ( \
                     SELECT 1 FROM ops_agent.recommendations \
                     WHERE insight_id = $2 AND rec_type = $3 \
                 )",
            )
            .bind(record.id)
            .bind(insight_id)
            .bind(&record.kind)
            .bind(record.severity.as_str())
            .bind(i32::try_from(record.priority).unwrap_or(i32::MAX))
            .bind(&record.title)
            .bind(&record.impact)
            .bind(&record.payload)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RecommendationRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM ops_agent.recommendations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn update_status_with_guard(
        &self,
        id: Uuid,
        new_status: RecommendationStatus,
        expected: RecommendationStatus,
    ) -> Result<bool, StoreError> {
        if !RecommendationStatus::transition_allowed(expected, new_status) {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE ops_agent.recommendations \
             SET status = $1, updated_at = now() \
             WHERE id = $2 AND status = $3",
        )
        .bind(new_status.as_str())
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn worklist(
        &self,
        filter: &WorklistFilter,
        cursor: Option<WorklistCursor>,
        limit: u32,
    ) -> Result<Vec<RecommendationRecord>, StoreError> {
        let (cursor_status, cursor_ts) = match &cursor {
            Some(c) => (Some(c.status.clone()), Some(c.created_at)),
            None => (None, None),
        };

        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM ops_agent.recommendations \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::text IS NULL OR severity = $2) \
               AND ($3::text IS NULL OR rec_type = $3) \
               AND ($4::text IS NULL OR (status, created_at) < ($4::text, $5::timestamptz)) \
             ORDER BY status DESC, created_at DESC \
             LIMIT $6"
        ))
        .bind(filter.status.map(RecommendationStatus::as_str))
        .bind(filter.severity.map(Severity::as_str))
        .bind(filter.kind.as_deref())
        .bind(cursor_status)
        .bind(cursor_ts)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }
}
