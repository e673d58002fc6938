//! In-memory repository implementations.
//!
//! Behavioral doubles for the Postgres repositories: version increments,
//! guarded status updates, idempotent upserts, and keyset ordering all
//! match the SQL implementations. Used by the test suite and by offline
//! dry runs where no database is available.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::{InvestigationState, InvestigationStatus, Severity, ToolExecution};

use super::audit::{AuditEntry, AuditRepo};
use super::embeddings::{EmbeddingIndex, NeighborHit};
use super::insights::{EvidenceRecord, InsightRecord, InsightRepo};
use super::investigations::{Investigation, InvestigationRepo};
use super::recommendations::{
    RecommendationRecord, RecommendationRepo, RecommendationStatus, WorklistCursor, WorklistFilter,
};
use super::rule_drafts::{RuleDraftRecord, RuleDraftRepo, RuleDraftStatus};
use super::state_store::StateStore;
use super::tool_log::ToolLogRepo;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── Investigations ──────────────────────────────────────────────

/// In-memory investigation rows.
#[derive(Debug, Default)]
pub struct MemoryInvestigationRepo {
    rows: Mutex<HashMap<Uuid, Investigation>>,
}

#[async_trait]
impl InvestigationRepo for MemoryInvestigationRepo {
    async fn create(&self, investigation: &Investigation) -> Result<(), StoreError> {
        lock(&self.rows).insert(investigation.id, investigation.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Investigation>, StoreError> {
        Ok(lock(&self.rows).get(&id).cloned())
    }

    async fn find_active_for_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Investigation>, StoreError> {
        Ok(lock(&self.rows)
            .values()
            .filter(|inv| {
                inv.transaction_id == transaction_id
                    && matches!(
                        inv.status,
                        InvestigationStatus::Pending | InvestigationStatus::InProgress
                    )
            })
            .max_by_key(|inv| inv.started_at)
            .cloned())
    }

    async fn set_status(&self, id: Uuid, status: InvestigationStatus) -> Result<(), StoreError> {
        let mut rows = lock(&self.rows);
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("investigation {id}")))?;
        row.status = status;
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
        let mut rows = lock(&self.rows);
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("investigation {id}")))?;
        row.status = status;
        row.severity = Some(severity);
        row.final_confidence = Some(final_confidence);
        row.step_count = step_count;
        row.completed_at = Some(completed_at);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(lock(&self.rows).remove(&id).is_some())
    }
}

// ── State store ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StoredState {
    payload: serde_json::Value,
    version: i64,
    updated_at: DateTime<Utc>,
}

/// In-memory versioned state snapshots.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    rows: Mutex<HashMap<Uuid, StoredState>>,
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save_state(
        &self,
        investigation_id: Uuid,
        state: &InvestigationState,
    ) -> Result<i64, StoreError> {
        let payload = serde_json::to_value(state)?;
        let mut rows = lock(&self.rows);
        let version = rows
            .get(&investigation_id)
            .map(|s| s.version.saturating_add(1))
            .unwrap_or(1);
        rows.insert(
            investigation_id,
            StoredState {
                payload,
                version,
                updated_at: Utc::now(),
            },
        );
        Ok(version)
    }

    async fn load_state(
        &self,
        investigation_id: Uuid,
    ) -> Result<Option<InvestigationState>, StoreError> {
        match lock(&self.rows).get(&investigation_id) {
            Some(stored) => {
                let state: InvestigationState = serde_json::from_value(stored.payload.clone())?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn delete_state(&self, investigation_id: Uuid) -> Result<bool, StoreError> {
        Ok(lock(&self.rows).remove(&investigation_id).is_some())
    }

    async fn prune_expired(&self, retention_days: u32) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let mut rows = lock(&self.rows);
        let before = rows.len();
        rows.retain(|_, stored| stored.updated_at >= cutoff);
        Ok(u64::try_from(before.saturating_sub(rows.len())).unwrap_or(0))
    }
}

impl MemoryStateStore {
    /// Current version for an investigation, if any. Test helper.
    pub fn version_of(&self, investigation_id: Uuid) -> Option<i64> {
        lock(&self.rows).get(&investigation_id).map(|s| s.version)
    }
}

// ── Tool log ────────────────────────────────────────────────────

/// In-memory tool execution log.
#[derive(Debug, Default)]
pub struct MemoryToolLogRepo {
    rows: Mutex<Vec<(Uuid, ToolExecution)>>,
}

#[async_trait]
impl ToolLogRepo for MemoryToolLogRepo {
    async fn append_batch(
        &self,
        investigation_id: Uuid,
        executions: &[ToolExecution],
    ) -> Result<(), StoreError> {
        let mut rows = lock(&self.rows);
        for execution in executions {
            rows.push((investigation_id, execution.clone()));
        }
        Ok(())
    }

    async fn list(&self, investigation_id: Uuid) -> Result<Vec<ToolExecution>, StoreError> {
        let mut executions: Vec<ToolExecution> = lock(&self.rows)
            .iter()
            .filter(|(id, _)| *id == investigation_id)
            .map(|(_, e)| e.clone())
            .collect();
        executions.sort_by_key(|e| e.step_number);
        Ok(executions)
    }
}

// ── Insights ────────────────────────────────────────────────────

/// In-memory insight and evidence rows.
#[derive(Debug, Default)]
pub struct MemoryInsightRepo {
    insights: Mutex<HashMap<String, InsightRecord>>,
    evidence: Mutex<HashMap<Uuid, Vec<EvidenceRecord>>>,
}

#[async_trait]
impl InsightRepo for MemoryInsightRepo {
    async fn upsert_insight(&self, insight: &InsightRecord) -> Result<Uuid, StoreError> {
        let mut insights = lock(&self.insights);
        if let Some(existing) = insights.get_mut(&insight.idempotency_key) {
            existing.investigation_id = insight.investigation_id;
            existing.severity = insight.severity;
            existing.summary = insight.summary.clone();
            existing.model_mode = insight.model_mode.clone();
            existing.updated_at = Utc::now();
            return Ok(existing.id);
        }
        insights.insert(insight.idempotency_key.clone(), insight.clone());
        Ok(insight.id)
    }

    async fn replace_evidence(
        &self,
        insight_id: Uuid,
        evidence: &[EvidenceRecord],
    ) -> Result<(), StoreError> {
        lock(&self.evidence).insert(insight_id, evidence.to_vec());
        Ok(())
    }

    async fn list_for_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Vec<InsightRecord>, StoreError> {
        let mut records: Vec<InsightRecord> = lock(&self.insights)
            .values()
            .filter(|i| i.transaction_id == transaction_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    async fn list_evidence(&self, insight_id: Uuid) -> Result<Vec<EvidenceRecord>, StoreError> {
        let mut records = lock(&self.evidence)
            .get(&insight_id)
            .cloned()
            .unwrap_or_default();
        records.sort_by_key(|e| e.created_at);
        Ok(records)
    }
}

// ── Recommendations ─────────────────────────────────────────────

/// In-memory recommendation rows.
#[derive(Debug, Default)]
pub struct MemoryRecommendationRepo {
    rows: Mutex<Vec<RecommendationRecord>>,
}

#[async_trait]
impl RecommendationRepo for MemoryRecommendationRepo {
    async fn replace_for_insight(
        &self,
        insight_id: Uuid,
        recommendations: &[RecommendationRecord],
    ) -> Result<(), StoreError> {
        let mut rows = lock(&self.rows);
        rows.retain(|r| {
            !(r.insight_id == insight_id && r.status == RecommendationStatus::Open)
        });
        for record in recommendations {
            let kind_taken = rows
                .iter()
                .any(|r| r.insight_id == insight_id && r.kind == record.kind);
            if !kind_taken {
                let mut fresh = record.clone();
                fresh.status = RecommendationStatus::Open;
                rows.push(fresh);
            }
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RecommendationRecord>, StoreError> {
        Ok(lock(&self.rows).iter().find(|r| r.id == id).cloned())
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
        let mut rows = lock(&self.rows);
        match rows.iter_mut().find(|r| r.id == id && r.status == expected) {
            Some(row) => {
                row.status = new_status;
                row.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn worklist(
        &self,
        filter: &WorklistFilter,
        cursor: Option<WorklistCursor>,
        limit: u32,
    ) -> Result<Vec<RecommendationRecord>, StoreError> {
        let mut rows: Vec<RecommendationRecord> = lock(&self.rows)
            .iter()
            .filter(|r| filter.status.map(|s| r.status == s).unwrap_or(true))
            .filter(|r| filter.severity.map(|s| r.severity == s).unwrap_or(true))
            .filter(|r| {
                filter
                    .kind
                    .as_deref()
                    .map(|k| r.kind == k)
                    .unwrap_or(true)
            })
            .filter(|r| match &cursor {
                Some(c) => {
                    (r.status.as_str().to_owned(), r.created_at)
                        < (c.status.clone(), c.created_at)
                }
                None => true,
            })
            .cloned()
            .collect();

        rows.sort_by(|a, b| {
            (b.status.as_str(), b.created_at).cmp(&(a.status.as_str(), a.created_at))
        });
        rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(rows)
    }
}

// ── Rule drafts ─────────────────────────────────────────────────

/// In-memory rule draft rows.
#[derive(Debug, Default)]
pub struct MemoryRuleDraftRepo {
    rows: Mutex<HashMap<Uuid, RuleDraftRecord>>,
}

#[async_trait]
impl RuleDraftRepo for MemoryRuleDraftRepo {
    async fn upsert(&self, record: &RuleDraftRecord) -> Result<(), StoreError> {
        lock(&self.rows).insert(record.investigation_id, record.clone());
        Ok(())
    }

    async fn get_for_investigation(
        &self,
        investigation_id: Uuid,
    ) -> Result<Option<RuleDraftRecord>, StoreError> {
        Ok(lock(&self.rows).get(&investigation_id).cloned())
    }

    async fn set_status(&self, id: Uuid, status: RuleDraftStatus) -> Result<(), StoreError> {
        let mut rows = lock(&self.rows);
        match rows.values_mut().find(|r| r.id == id) {
            Some(row) => {
                row.status = status;
                row.updated_at = Utc::now();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("rule draft {id}"))),
        }
    }
}

// ── Audit ───────────────────────────────────────────────────────

/// In-memory audit log.
#[derive(Debug, Default)]
pub struct MemoryAuditRepo {
    rows: Mutex<Vec<AuditEntry>>,
}

#[async_trait]
impl AuditRepo for MemoryAuditRepo {
    async fn append(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        lock(&self.rows).push(entry.clone());
        Ok(())
    }

    async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(lock(&self.rows)
            .iter()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned()
            .collect())
    }
}

// ── Embeddings ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StoredEmbedding {
    summary: String,
    embedding: Vec<f32>,
    created_at: DateTime<Utc>,
}

/// In-memory embedding index with exact cosine search.
#[derive(Debug, Default)]
pub struct MemoryEmbeddingIndex {
    rows: Mutex<HashMap<String, StoredEmbedding>>,
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

impl MemoryEmbeddingIndex {
    /// Stored summary for a transaction, if any. Test helper.
    pub fn summary_of(&self, transaction_id: &str) -> Option<String> {
        lock(&self.rows)
            .get(transaction_id)
            .map(|s| s.summary.clone())
    }
}

#[async_trait]
impl EmbeddingIndex for MemoryEmbeddingIndex {
    async fn upsert(
        &self,
        transaction_id: &str,
        summary: &str,
        embedding: &[f32],
    ) -> Result<(), StoreError> {
        lock(&self.rows).insert(
            transaction_id.to_owned(),
            StoredEmbedding {
                summary: summary.to_owned(),
                embedding: embedding.to_vec(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn search(
        &self,
        embedding: &[f32],
        limit: u32,
        max_age_days: u32,
        min_similarity: f64,
        exclude_transaction_id: &str,
    ) -> Result<Vec<NeighborHit>, StoreError> {
        let now = Utc::now();
        let cutoff = now - Duration::days(i64::from(max_age_days));
        let mut hits: Vec<NeighborHit> = lock(&self.rows)
            .iter()
            .filter(|(id, stored)| {
                id.as_str() != exclude_transaction_id && stored.created_at >= cutoff
            })
            .map(|(id, stored)| {
                let similarity = cosine_similarity(embedding, &stored.embedding);
                let age_seconds = now
                    .signed_duration_since(stored.created_at)
                    .num_seconds()
                    .max(0);
                #[allow(clippy::cast_precision_loss)]
                let age_days = age_seconds as f64 / 86_400.0;
                NeighborHit {
                    transaction_id: id.clone(),
                    similarity,
                    age_days,
                }
            })
            .filter(|hit| hit.similarity >= min_similarity)
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(hits)
    }
}
