//! Investigation service facade.
//!
//! The surface the HTTP layer calls: start, resume, fetch, worklist,
//! acknowledge, health, retention. The facade owns the concurrency cap
//! (a counting semaphore), the duplicate-run conflict check, and the
//! assembly of the agentic trace envelope returned to callers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::agent::{CompletionNode, CompletionRepos, InvestigationGraph, Planner, ToolExecutor};
use crate::config::Settings;
use crate::error::ServiceError;
use crate::llm::{ChatModel, Embedder};
use crate::redaction::PromptGuard;
use crate::state::{
    FeatureFlagsSnapshot, InvestigationMode, InvestigationState, InvestigationStatus,
    LlmUsage, PlannerDecision, Recommendation, RuleDraftPayload, SafeguardsSnapshot, Severity,
    TmApiUsage, ToolExecution, ACTION_COMPLETE,
};
use crate::store::{
    AuditEntry, EmbeddingIndex, EvidenceRecord, InsightRecord, Investigation, RecommendationRecord,
    RecommendationStatus, RuleDraftRecord, WorklistCursor, WorklistFilter,
};
use crate::tools::{
    similarity::canonical_summary, AgentTool, ContextTool, PatternTool, RecommendationTool,
    ReasoningTool, RuleDraftTool, SimilarityTool, ToolRegistry,
};
use crate::tm::TmApi;

// ── Request / response types ────────────────────────────────────

/// Request body for starting an investigation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Transaction to investigate.
    pub transaction_id: String,
    /// Execution mode.
    pub mode: InvestigationMode,
    /// Optional case the caller wants linked in the audit trail.
    pub case_id: Option<String>,
    /// Include the rule draft in the response envelope.
    pub include_rule_draft_preview: bool,
}

/// LLM and TM usage plus the frozen runtime flags, for audit replay.
#[derive(Debug, Clone, Serialize)]
pub struct AgenticTrace {
    /// LLM usage counters.
    pub llm_usage: LlmUsage,
    /// TM usage counters.
    pub tm_api_usage: TmApiUsage,
    /// Feature flags in effect at run start.
    pub feature_flags_snapshot: FeatureFlagsSnapshot,
    /// Safeguard budgets in effect at run start.
    pub safeguards_snapshot: SafeguardsSnapshot,
    /// Evidence buckets that stayed empty.
    pub evidence_gaps: Vec<String>,
    /// Tools the planner selected, in order.
    pub action_plan: Vec<String>,
}

/// The investigation response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct InvestigationEnvelope {
    /// Run identifier.
    pub investigation_id: Uuid,
    /// Transaction investigated.
    pub transaction_id: String,
    /// Lifecycle status.
    pub status: InvestigationStatus,
    /// Final severity.
    pub severity: Severity,
    /// Final confidence.
    pub confidence_score: f64,
    /// Planner steps taken.
    pub step_count: u32,
    /// Step cap.
    pub max_steps: u32,
    /// Every planner decision.
    pub planner_decisions: Vec<PlannerDecision>,
    /// Every tool execution.
    pub tool_executions: Vec<ToolExecution>,
    /// Ordered recommendations.
    pub recommendations: Vec<Recommendation>,
    /// Rule draft preview, when requested and present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_draft: Option<RuleDraftPayload>,
    /// When the run started.
    pub started_at: chrono::DateTime<Utc>,
    /// When the run finished.
    pub completed_at: Option<chrono::DateTime<Utc>>,
    /// Wall-clock duration.
    pub total_duration_ms: u64,
    /// The audit trace.
    pub agentic_trace: AgenticTrace,
}

/// Full detail for one investigation: envelope plus raw state.
#[derive(Debug, Clone, Serialize)]
pub struct InvestigationDetail {
    /// The response envelope.
    pub envelope: InvestigationEnvelope,
    /// The complete persisted state.
    pub state: InvestigationState,
}

/// An insight with its ordered evidence.
#[derive(Debug, Clone)]
pub struct InsightWithEvidence {
    /// The insight row.
    pub insight: InsightRecord,
    /// Evidence rows ordered by creation.
    pub evidence: Vec<EvidenceRecord>,
}

/// One page of the recommendation worklist.
#[derive(Debug, Clone)]
pub struct WorklistPage {
    /// Rows in `(status, created_at)` descending order.
    pub items: Vec<RecommendationRecord>,
    /// Cursor for the next page, when more rows may exist.
    pub next_cursor: Option<String>,
}

/// Aggregate health of the service's dependencies.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Database reachable.
    pub database: bool,
    /// TM service healthy.
    pub tm: bool,
}

/// Analyst action on a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcknowledgeAction {
    /// Accept the recommendation.
    Acknowledged,
    /// Reject it.
    Rejected,
}

impl AcknowledgeAction {
    /// Parse the wire action string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACKNOWLEDGED" => Some(Self::Acknowledged),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }

    fn target_status(self) -> RecommendationStatus {
        match self {
            Self::Acknowledged => RecommendationStatus::Acknowledged,
            Self::Rejected => RecommendationStatus::Rejected,
        }
    }
}

// ── Service ─────────────────────────────────────────────────────

/// The investigation service.
pub struct InvestigationService {
    settings: Arc<Settings>,
    repos: CompletionRepos,
    embeddings: Arc<dyn EmbeddingIndex>,
    tm: Arc<dyn TmApi>,
    embedder: Option<Arc<dyn Embedder>>,
    graph: InvestigationGraph,
    semaphore: Arc<Semaphore>,
}

impl InvestigationService {
    /// Wire the service together from settings, repositories, and
    /// collaborators.
    pub fn new(
        settings: Settings,
        repos: CompletionRepos,
        embeddings: Arc<dyn EmbeddingIndex>,
        tm: Arc<dyn TmApi>,
        chat_model: Option<Arc<dyn ChatModel>>,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Self {
        let guard = Arc::new(PromptGuard::new(settings.llm.prompt_guard_enabled));

        let registry = Arc::new(ToolRegistry::new(vec![
            AgentTool::Context(ContextTool::new(Arc::clone(&tm), settings.tm.clone())),
            AgentTool::Pattern(PatternTool::new(settings.scoring.clone())),
            AgentTool::Similarity(SimilarityTool::new(
                embedder.clone(),
                Arc::clone(&embeddings),
                settings.vector.clone(),
            )),
            AgentTool::Reasoning(ReasoningTool::new(
                chat_model.clone(),
                Arc::clone(&guard),
                settings.llm.clone(),
            )),
            AgentTool::Recommendation(RecommendationTool::new()),
            AgentTool::RuleDraft(RuleDraftTool::new(settings.scoring.clone())),
        ]));

        let planner = Planner::new(
            chat_model,
            guard,
            settings.planner.clone(),
            Duration::from_secs(settings.agent.planner_timeout_seconds),
        );
        let executor = ToolExecutor::new(
            Arc::clone(&registry),
            Duration::from_secs(settings.agent.tool_timeout_seconds),
        );
        let completion = CompletionNode::new(repos.clone(), settings.scoring.clone());
        let graph = InvestigationGraph::new(
            planner,
            executor,
            completion,
            registry,
            Arc::clone(&repos.state_store),
            Arc::clone(&repos.investigations),
        );

        let permits = usize::try_from(settings.agent.max_concurrent_investigations.max(1))
            .unwrap_or(1);
        Self {
            settings: Arc::new(settings),
            repos,
            embeddings,
            tm,
            embedder,
            graph,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Start a new investigation and drive it to a terminal state.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for a bad transaction id, `Conflict` when one is
    /// already running for the same transaction, `Internal` when the
    /// final row update fails.
    pub async fn run_investigation(
        &self,
        request: RunRequest,
    ) -> Result<InvestigationEnvelope, ServiceError> {
        let transaction_id = request.transaction_id.trim().to_owned();
        if transaction_id.is_empty() || transaction_id.len() > 128 {
            return Err(ServiceError::InvalidRequest(
                "transaction_id must be 1-128 characters".to_owned(),
            ));
        }

        if let Some(existing) = self
            .repos
            .investigations
            .find_active_for_transaction(&transaction_id)
            .await?
        {
            return Err(ServiceError::Conflict {
                message: format!("investigation already in progress for {transaction_id}"),
                existing_investigation_id: Some(existing.id),
            });
        }

        let _permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| ServiceError::Internal(format!("semaphore closed: {e}")))?;

        let investigation_id = Uuid::new_v4();
        let started_at = Utc::now();
        let state = InvestigationState::new(
            investigation_id,
            transaction_id.clone(),
            request.mode,
            self.settings.feature_flags(),
            self.settings.safeguards(),
            self.settings.planner.model.clone(),
            started_at,
        );

        self.repos
            .investigations
            .create(&Investigation {
                id: investigation_id,
                transaction_id: transaction_id.clone(),
                mode: request.mode,
                status: InvestigationStatus::Pending,
                severity: None,
                final_confidence: None,
                step_count: 0,
                max_steps: state.max_steps,
                planner_model: self.settings.planner.model.clone(),
                started_at,
                completed_at: None,
            })
            .await?;
        if let Err(e) = self
            .repos
            .state_store
            .save_state(investigation_id, &state)
            .await
        {
            tracing::warn!(error = %e, "initial snapshot write failed");
        }
        self.audit_best_effort(AuditEntry::system(
            "investigation",
            &investigation_id.to_string(),
            "created",
            json!({
                "transaction_id": transaction_id,
                "mode": request.mode,
                "case_id": request.case_id,
            }),
        ))
        .await;

        let final_state = self.graph.run(state).await?;
        self.index_transaction(&final_state).await;

        Ok(envelope_from_state(
            &final_state,
            request.include_rule_draft_preview,
        ))
    }

    /// Resume an investigation from its latest snapshot.
    ///
    /// A terminal investigation is returned as-is; a non-terminal one
    /// re-enters the graph at the planner.
    ///
    /// # Errors
    ///
    /// `NotFound` when no snapshot exists.
    pub async fn resume(
        &self,
        investigation_id: Uuid,
    ) -> Result<InvestigationEnvelope, ServiceError> {
        let state = self
            .repos
            .state_store
            .load_state(investigation_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("investigation {investigation_id}"))
            })?;

        if state.status.is_terminal() {
            return Ok(envelope_from_state(&state, true));
        }

        let _permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| ServiceError::Internal(format!("semaphore closed: {e}")))?;

        self.audit_best_effort(AuditEntry::system(
            "investigation",
            &investigation_id.to_string(),
            "resumed",
            json!({ "completed_steps": state.completed_steps }),
        ))
        .await;

        let final_state = self.graph.run(state).await?;
        self.index_transaction(&final_state).await;
        Ok(envelope_from_state(&final_state, true))
    }

    /// Fetch full detail: envelope plus raw state.
    ///
    /// # Errors
    ///
    /// `NotFound` when the investigation or its snapshot is absent.
    pub async fn get_investigation(
        &self,
        investigation_id: Uuid,
    ) -> Result<InvestigationDetail, ServiceError> {
        let state = self
            .repos
            .state_store
            .load_state(investigation_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("investigation {investigation_id}"))
            })?;
        Ok(InvestigationDetail {
            envelope: envelope_from_state(&state, true),
            state,
        })
    }

    /// Fetch the rule draft for an investigation, if present.
    ///
    /// # Errors
    ///
    /// `NotFound` when the investigation does not exist.
    pub async fn rule_draft(
        &self,
        investigation_id: Uuid,
    ) -> Result<Option<RuleDraftRecord>, ServiceError> {
        if self
            .repos
            .investigations
            .get(investigation_id)
            .await?
            .is_none()
        {
            return Err(ServiceError::NotFound(format!(
                "investigation {investigation_id}"
            )));
        }
        Ok(self
            .repos
            .rule_drafts
            .get_for_investigation(investigation_id)
            .await?)
    }

    /// Persisted insights for a transaction, newest first, each with its
    /// evidence.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn insights_for_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Vec<InsightWithEvidence>, ServiceError> {
        let insights = self
            .repos
            .insights
            .list_for_transaction(transaction_id)
            .await?;
        let mut out = Vec::with_capacity(insights.len());
        for insight in insights {
            let evidence = self.repos.insights.list_evidence(insight.id).await?;
            out.push(InsightWithEvidence { insight, evidence });
        }
        Ok(out)
    }

    /// Keyset-paginated recommendation worklist.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for an unparseable cursor.
    pub async fn worklist(
        &self,
        filter: WorklistFilter,
        cursor: Option<String>,
        limit: u32,
    ) -> Result<WorklistPage, ServiceError> {
        let cursor = match cursor {
            Some(raw) => Some(WorklistCursor::decode(&raw).ok_or_else(|| {
                ServiceError::InvalidRequest("malformed worklist cursor".to_owned())
            })?),
            None => None,
        };
        let limit = limit.clamp(1, 200);
        let items = self
            .repos
            .recommendations
            .worklist(&filter, cursor, limit)
            .await?;

        let next_cursor = if items.len() == usize::try_from(limit).unwrap_or(usize::MAX) {
            items.last().map(|last| {
                WorklistCursor {
                    status: last.status.as_str().to_owned(),
                    created_at: last.created_at,
                }
                .encode()
            })
        } else {
            None
        };
        Ok(WorklistPage { items, next_cursor })
    }

    /// Analyst action on a recommendation, with a guarded status update.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing row, `Conflict` when the guarded update
    /// does not apply.
    pub async fn acknowledge_recommendation(
        &self,
        recommendation_id: Uuid,
        action: AcknowledgeAction,
        comment: Option<String>,
        performed_by: &str,
    ) -> Result<RecommendationRecord, ServiceError> {
        let existing = self
            .repos
            .recommendations
            .get(recommendation_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("recommendation {recommendation_id}"))
            })?;

        let applied = self
            .repos
            .recommendations
            .update_status_with_guard(
                recommendation_id,
                action.target_status(),
                RecommendationStatus::Open,
            )
            .await?;
        if !applied {
            return Err(ServiceError::Conflict {
                message: format!(
                    "recommendation is {} and cannot transition",
                    existing.status.as_str()
                ),
                existing_investigation_id: None,
            });
        }

        self.audit_best_effort(AuditEntry {
            entity_type: "recommendation".to_owned(),
            entity_id: recommendation_id.to_string(),
            action: action.target_status().as_str().to_lowercase(),
            performed_by: performed_by.to_owned(),
            new_value: json!({
                "from": "OPEN",
                "to": action.target_status().as_str(),
                "comment": comment,
            }),
            created_at: Utc::now(),
        })
        .await;

        self.repos
            .recommendations
            .get(recommendation_id)
            .await?
            .ok_or_else(|| ServiceError::Internal("recommendation vanished".to_owned()))
    }

    /// Aggregate dependency health.
    pub async fn health(&self) -> HealthReport {
        let database = self
            .repos
            .investigations
            .get(Uuid::nil())
            .await
            .is_ok();
        let tm = self.tm.health().await;
        HealthReport { database, tm }
    }

    /// Retention sweep: remove state snapshots past the configured
    /// retention window. Returns rows removed.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn prune_expired_state(&self) -> Result<u64, ServiceError> {
        let removed = self
            .repos
            .state_store
            .prune_expired(self.settings.agent.state_retention_days)
            .await?;
        if removed > 0 {
            tracing::info!(removed, "pruned expired state snapshots");
        }
        Ok(removed)
    }

    /// Index the investigated transaction for future similarity searches.
    /// Best-effort: indexing failures never affect the investigation.
    async fn index_transaction(&self, state: &InvestigationState) {
        if !self.settings.vector.enabled {
            return;
        }
        let (Some(embedder), Some(ctx)) = (self.embedder.as_ref(), state.context.as_ref()) else {
            return;
        };
        let summary = canonical_summary(&ctx.transaction);
        match embedder.embed(&summary).await {
            Ok(embedding) => {
                if let Err(e) = self
                    .embeddings
                    .upsert(&state.transaction_id, &summary, &embedding)
                    .await
                {
                    tracing::warn!(error = %e, "embedding upsert failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "post-run embedding failed"),
        }
    }

    async fn audit_best_effort(&self, entry: AuditEntry) {
        if let Err(e) = self.repos.audit.append(&entry).await {
            tracing::error!(error = %e, action = %entry.action, "audit append failed");
        }
    }
}

/// Build the response envelope from a state.
pub fn envelope_from_state(
    state: &InvestigationState,
    include_rule_draft: bool,
) -> InvestigationEnvelope {
    let end = state.completed_at.unwrap_or_else(Utc::now);
    let total_duration_ms = u64::try_from(
        end.signed_duration_since(state.started_at)
            .num_milliseconds()
            .max(0),
    )
    .unwrap_or(0);

    let action_plan: Vec<String> = state
        .planner_decisions
        .iter()
        .filter(|d| d.selected_tool != ACTION_COMPLETE)
        .map(|d| d.selected_tool.clone())
        .collect();

    InvestigationEnvelope {
        investigation_id: state.investigation_id,
        transaction_id: state.transaction_id.clone(),
        status: state.status,
        severity: state.severity,
        confidence_score: state.confidence_score,
        step_count: state.step_count,
        max_steps: state.max_steps,
        planner_decisions: state.planner_decisions.clone(),
        tool_executions: state.tool_executions.clone(),
        recommendations: state.recommendations.clone(),
        rule_draft: if include_rule_draft {
            state.rule_draft.clone()
        } else {
            None
        },
        started_at: state.started_at,
        completed_at: state.completed_at,
        total_duration_ms,
        agentic_trace: AgenticTrace {
            llm_usage: state.llm_usage.clone(),
            tm_api_usage: state.tm_usage.clone(),
            feature_flags_snapshot: state.feature_flags,
            safeguards_snapshot: state.safeguards,
            evidence_gaps: state.evidence_gaps(),
            action_plan,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledge_action_parse() {
        assert_eq!(
            AcknowledgeAction::parse("ACKNOWLEDGED"),
            Some(AcknowledgeAction::Acknowledged)
        );
        assert_eq!(
            AcknowledgeAction::parse("REJECTED"),
            Some(AcknowledgeAction::Rejected)
        );
        assert_eq!(AcknowledgeAction::parse("EXPORTED"), None);
        assert_eq!(AcknowledgeAction::parse("open"), None);
    }
}
