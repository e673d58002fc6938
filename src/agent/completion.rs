//! Completion node: aggregate, finalize, persist.
//!
//! Final confidence is a weighted mean of reasoning (0.5), pattern (0.3)
//! and similarity (0.2) components, with weights redistributed
//! proportionally when a component is missing. Final severity is the max
//! of the reasoning risk level and the pattern-derived level; an
//! escalation from reasoning is audited.
//!
//! Persistence is audit-first, best-effort downstream: each step runs in
//! its own transaction, failures become `dependency_failure` audit
//! entries, and only the investigation row update is allowed to fail the
//! whole call.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::config::ScoringSettings;
use crate::error::ServiceError;
use crate::state::{InvestigationState, InvestigationStatus, Severity};
use crate::store::{
    AuditEntry, AuditRepo, EvidenceRecord, InsightRecord, InsightRepo, InvestigationRepo,
    RecommendationRecord, RecommendationRepo, RecommendationStatus, RuleDraftRecord, RuleDraftRepo,
    RuleDraftStatus, StateStore, ToolLogRepo,
};
use crate::tools::{insight_idempotency_key, pattern::severity_from_score};

/// Everything the completion node persists into.
#[derive(Clone)]
pub struct CompletionRepos {
    /// Investigation rows.
    pub investigations: Arc<dyn InvestigationRepo>,
    /// State snapshots.
    pub state_store: Arc<dyn StateStore>,
    /// Tool execution log.
    pub tool_log: Arc<dyn ToolLogRepo>,
    /// Insights and evidence.
    pub insights: Arc<dyn InsightRepo>,
    /// Recommendation worklist.
    pub recommendations: Arc<dyn RecommendationRepo>,
    /// Rule drafts.
    pub rule_drafts: Arc<dyn RuleDraftRepo>,
    /// Audit log.
    pub audit: Arc<dyn AuditRepo>,
}

/// The completion node.
pub struct CompletionNode {
    repos: CompletionRepos,
    scoring: ScoringSettings,
}

impl CompletionNode {
    /// Create a completion node.
    pub fn new(repos: CompletionRepos, scoring: ScoringSettings) -> Self {
        Self { repos, scoring }
    }

    /// Finalize and persist. `timed_out` forces the TIMED_OUT status.
    ///
    /// # Errors
    ///
    /// Returns an error only when the investigation row update fails; all
    /// other persistence failures are absorbed into the audit log.
    pub async fn finalize(
        &self,
        state: InvestigationState,
        timed_out: bool,
    ) -> Result<InvestigationState, ServiceError> {
        let mut next = state;
        next.next_action = None;
        next.completed_at = Some(Utc::now());
        next.status = if timed_out {
            InvestigationStatus::TimedOut
        } else if next.error.is_some() && next.context.is_none() {
            InvestigationStatus::Failed
        } else {
            InvestigationStatus::Completed
        };
        if timed_out && next.error.is_none() {
            next.error = Some("investigation deadline exceeded".to_owned());
        }

        next.confidence_score = final_confidence(&next);

        let pattern_severity = severity_from_score(
            next.pattern_results
                .as_ref()
                .map(|p| p.overall_score)
                .unwrap_or(0.0),
            &self.scoring,
        );
        let reasoning_severity = next
            .reasoning
            .as_ref()
            .map(|r| r.risk_level)
            .unwrap_or(Severity::Low);
        let final_severity = pattern_severity.max(reasoning_severity);
        if reasoning_severity > pattern_severity {
            self.audit_best_effort(AuditEntry::system(
                "investigation",
                &next.investigation_id.to_string(),
                "severity_escalated",
                json!({
                    "from": pattern_severity.as_str(),
                    "to": reasoning_severity.as_str(),
                    "source": "reasoning",
                }),
            ))
            .await;
        }
        next.severity = final_severity;

        let id = next.investigation_id;
        let entity_id = id.to_string();

        // (a) The investigation row update must succeed.
        self.repos
            .investigations
            .finalize(
                id,
                next.status,
                next.severity,
                next.confidence_score,
                next.step_count,
                next.completed_at.unwrap_or_else(Utc::now),
            )
            .await
            .map_err(|e| ServiceError::Internal(format!("investigation finalize: {e}")))?;

        // (b) Final state snapshot.
        if let Err(e) = self.repos.state_store.save_state(id, &next).await {
            self.record_step_failure(&entity_id, "state_snapshot", &e.to_string())
                .await;
        }

        // (c) Tool execution log.
        if let Err(e) = self
            .repos
            .tool_log
            .append_batch(id, &next.tool_executions)
            .await
        {
            self.record_step_failure(&entity_id, "tool_log", &e.to_string())
                .await;
        }

        // (d) Insight and evidence.
        let insight_id = match self.persist_insight(&next).await {
            Ok(insight_id) => Some(insight_id),
            Err(e) => {
                self.record_step_failure(&entity_id, "insight", &e.to_string())
                    .await;
                None
            }
        };

        // (e) Recommendations, owned by the insight.
        if let Some(insight_id) = insight_id {
            if let Err(e) = self.persist_recommendations(&next, insight_id).await {
                self.record_step_failure(&entity_id, "recommendations", &e.to_string())
                    .await;
            }
        }

        // (f) Rule draft, when present.
        if let Some(draft) = &next.rule_draft {
            let record = RuleDraftRecord {
                id: Uuid::new_v4(),
                investigation_id: id,
                status: RuleDraftStatus::Pending,
                payload: draft.clone(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            if let Err(e) = self.repos.rule_drafts.upsert(&record).await {
                self.record_step_failure(&entity_id, "rule_draft", &e.to_string())
                    .await;
            }
        }

        // (g) Lifecycle audit entry.
        let lifecycle_action = match next.status {
            InvestigationStatus::TimedOut => "timed_out",
            InvestigationStatus::Failed => "failed",
            _ => "completed",
        };
        self.audit_best_effort(AuditEntry::system(
            "investigation",
            &entity_id,
            lifecycle_action,
            json!({
                "severity": next.severity.as_str(),
                "confidence": next.confidence_score,
                "step_count": next.step_count,
                "completed_steps": next.completed_steps,
            }),
        ))
        .await;

        Ok(next)
    }

    async fn persist_insight(
        &self,
        state: &InvestigationState,
    ) -> Result<Uuid, crate::error::StoreError> {
        let insight = build_insight(state);
        let insight_id = self.repos.insights.upsert_insight(&insight).await?;

        let base = Utc::now();
        let evidence: Vec<EvidenceRecord> = state
            .evidence
            .iter()
            .enumerate()
            .map(|(index, envelope)| EvidenceRecord {
                id: Uuid::new_v4(),
                insight_id,
                category: envelope.category.clone(),
                tool: envelope.tool.clone(),
                description: envelope.description.clone(),
                payload: envelope.data.clone(),
                // Stagger timestamps so `ORDER BY created_at` preserves
                // tool order.
                created_at: base + Duration::milliseconds(i64::try_from(index).unwrap_or(0)),
            })
            .collect();
        self.repos
            .insights
            .replace_evidence(insight_id, &evidence)
            .await?;
        Ok(insight_id)
    }

    async fn persist_recommendations(
        &self,
        state: &InvestigationState,
        insight_id: Uuid,
    ) -> Result<(), crate::error::StoreError> {
        let records: Vec<RecommendationRecord> = state
            .recommendations
            .iter()
            .map(|rec| RecommendationRecord {
                id: rec.id,
                insight_id,
                kind: rec.kind.clone(),
                status: RecommendationStatus::Open,
                severity: state.severity,
                priority: rec.priority,
                title: rec.title.clone(),
                impact: rec.impact.clone(),
                payload: rec.payload.clone(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .collect();
        self.repos
            .recommendations
            .replace_for_insight(insight_id, &records)
            .await
    }

    async fn record_step_failure(&self, entity_id: &str, step: &str, error: &str) {
        tracing::error!(entity_id, step, error, "completion persistence step failed");
        self.audit_best_effort(AuditEntry::system(
            "investigation",
            entity_id,
            "dependency_failure",
            json!({ "step": step, "error": error }),
        ))
        .await;
    }

    async fn audit_best_effort(&self, entry: AuditEntry) {
        if let Err(e) = self.repos.audit.append(&entry).await {
            tracing::error!(error = %e, action = %entry.action, "audit append failed");
        }
    }
}

/// Weighted mean of the available scoring components.
pub fn final_confidence(state: &InvestigationState) -> f64 {
    let mut components: Vec<(f64, f64)> = Vec::new();
    if let Some(reasoning) = &state.reasoning {
        components.push((reasoning.confidence, 0.5));
    }
    if let Some(patterns) = &state.pattern_results {
        components.push((patterns.overall_score, 0.3));
    }
    if let Some(similarity) = &state.similarity_results {
        if !similarity.skipped {
            components.push((similarity.overall_score, 0.2));
        }
    }

    let weight_sum: f64 = components.iter().map(|(_, w)| w).sum();
    if weight_sum <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = components.iter().map(|(v, w)| v * w).sum();
    (weighted / weight_sum).clamp(0.0, 1.0)
}

/// Build the durable insight summary for a finished run.
fn build_insight(state: &InvestigationState) -> InsightRecord {
    let detected = state
        .pattern_results
        .as_ref()
        .map(|p| p.patterns_detected.clone())
        .unwrap_or_default();
    let narrative = state
        .reasoning
        .as_ref()
        .map(|r| crate::redaction::truncate_on_boundary(&r.explanation, 240).to_owned())
        .unwrap_or_default();
    let summary = if detected.is_empty() {
        format!(
            "{} risk on transaction {}. {}",
            state.severity.as_str(),
            state.transaction_id,
            narrative
        )
    } else {
        format!(
            "{} risk on transaction {} ({}). {}",
            state.severity.as_str(),
            state.transaction_id,
            detected.join(", "),
            narrative
        )
    };

    InsightRecord {
        id: Uuid::new_v4(),
        investigation_id: state.investigation_id,
        transaction_id: state.transaction_id.clone(),
        severity: state.severity,
        summary: summary.trim_end().to_owned(),
        evidence_kind: "agentic_investigation".to_owned(),
        model_mode: state
            .reasoning
            .as_ref()
            .map(|r| r.llm_status.clone())
            .unwrap_or_else(|| "fallback".to_owned()),
        idempotency_key: insight_idempotency_key(&state.transaction_id, state.mode),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{
        FeatureFlagsSnapshot, InvestigationMode, PatternResults, Reasoning, SafeguardsSnapshot,
        SimilarityResults,
    };
    use uuid::Uuid;

    fn state() -> InvestigationState {
        InvestigationState::new(
            Uuid::new_v4(),
            "txn_c".to_owned(),
            InvestigationMode::Full,
            FeatureFlagsSnapshot {
                planner_llm_enabled: false,
                vector_enabled: false,
                prompt_guard_enabled: true,
                rule_draft_export_enabled: false,
            },
            SafeguardsSnapshot {
                investigation_timeout_seconds: 120,
                tool_timeout_seconds: 30,
                planner_timeout_seconds: 10,
                max_steps: 20,
            },
            "model".to_owned(),
            Utc::now(),
        )
    }

    fn with_components(
        reasoning: Option<f64>,
        pattern: Option<f64>,
        similarity: Option<f64>,
    ) -> InvestigationState {
        let mut s = state();
        if let Some(confidence) = reasoning {
            s.reasoning = Some(Reasoning {
                risk_level: Severity::Medium,
                explanation: String::new(),
                hypotheses: vec![],
                confidence,
                llm_status: "llm".to_owned(),
            });
        }
        if let Some(overall) = pattern {
            s.pattern_results = Some(PatternResults {
                scores: vec![],
                overall_score: overall,
                patterns_detected: vec![],
            });
        }
        if let Some(overall) = similarity {
            s.similarity_results = Some(SimilarityResults {
                matches: vec![],
                overall_score: overall,
                skipped: false,
            });
        }
        s
    }

    #[test]
    fn test_confidence_full_weighting() {
        let s = with_components(Some(0.8), Some(0.6), Some(0.4));
        let expected = 0.8 * 0.5 + 0.6 * 0.3 + 0.4 * 0.2;
        assert!((final_confidence(&s) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_redistributes_missing_weights() {
        // Similarity missing: weights 0.5 / 0.3 renormalize.
        let s = with_components(Some(0.8), Some(0.6), None);
        let expected = (0.8 * 0.5 + 0.6 * 0.3) / 0.8;
        assert!((final_confidence(&s) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_single_component() {
        let s = with_components(None, Some(0.6), None);
        assert!((final_confidence(&s) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_skipped_similarity_excluded() {
        let mut s = with_components(Some(0.8), None, Some(0.9));
        s.similarity_results.as_mut().expect("sim").skipped = true;
        assert!((final_confidence(&s) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_empty_state_is_zero() {
        assert!((final_confidence(&state()) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_insight_key_and_summary() {
        let mut s = with_components(Some(0.8), Some(0.6), None);
        s.severity = Severity::High;
        s.pattern_results.as_mut().expect("p").patterns_detected =
            vec!["velocity".to_owned()];
        let insight = build_insight(&s);
        assert_eq!(insight.idempotency_key, "ops-agent:txn_c:FULL");
        assert!(insight.summary.contains("HIGH"));
        assert!(insight.summary.contains("velocity"));
        assert_eq!(insight.model_mode, "llm");
    }
}
