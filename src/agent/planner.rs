//! Planner node: select the next tool or finish.
//!
//! The planner consults the LLM with a structured prompt built from a
//! redacted state snapshot and the tool catalog, then applies
//! non-negotiable code-level constraints that override whatever the model
//! said. On any model problem — timeout, malformed JSON, unknown tool,
//! prompt-guard rejection — it falls back to the fixed deterministic
//! sequence. The planner never raises to the runtime.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;

use crate::config::PlannerSettings;
use crate::llm::{parse_json_response, ChatModel, ChatRequest};
use crate::redaction::{redact_state_for_prompt, PromptGuard};
use crate::state::{
    InvestigationMode, InvestigationState, InvestigationStatus, PlannerDecision, ACTION_COMPLETE,
};
use crate::tools::{
    ToolSummary, CONTEXT_TOOL, FALLBACK_SEQUENCE, RECOMMENDATION_TOOL, RULE_DRAFT_TOOL,
};

const SYSTEM_PROMPT: &str = "\
You are the planner of a card fraud investigation agent. You select the \
single next tool to run, or COMPLETE when nothing useful remains.

Ordering constraints (violations are rejected):
1. context_tool must run before anything else.
2. A tool may run at most once per investigation.
3. recommendation_tool requires reasoning to exist.
4. rule_draft_tool requires at least one recommendation.

Respond with ONLY a JSON object:
{\"tool\": \"<tool name or COMPLETE>\", \"reason\": \"...\", \"confidence\": 0.0}
No other keys, no commentary.";

#[derive(Debug, Deserialize)]
struct PlannerChoice {
    tool: String,
    #[serde(default)]
    reason: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

/// Outcome of one planning round, before it is written into state.
struct Selection {
    tool: String,
    reason: String,
    confidence: f64,
    used_fallback: bool,
}

/// The planner node.
pub struct Planner {
    model: Option<Arc<dyn ChatModel>>,
    guard: Arc<PromptGuard>,
    settings: PlannerSettings,
    timeout: Duration,
}

impl Planner {
    /// Create a planner. With `model = None` every decision comes from
    /// the deterministic sequence.
    pub fn new(
        model: Option<Arc<dyn ChatModel>>,
        guard: Arc<PromptGuard>,
        settings: PlannerSettings,
        timeout: Duration,
    ) -> Self {
        Self {
            model,
            guard,
            settings,
            timeout,
        }
    }

    /// Plan the next step, returning a new state with `next_action`,
    /// `planner_decisions`, and `step_count` updated.
    pub async fn plan(
        &self,
        state: &InvestigationState,
        catalog: &[ToolSummary],
    ) -> InvestigationState {
        let mut next = state.clone();
        if next.status == InvestigationStatus::Pending {
            next.status = InvestigationStatus::InProgress;
        }

        // Context could not be obtained and its tool already ran: nothing
        // downstream can work, terminate as failed.
        if next.context.is_none() && next.has_completed(CONTEXT_TOOL) {
            next.error = Some("no transaction context could be obtained".to_owned());
            record_complete(
                &mut next,
                "context unavailable after context_tool failure",
                true,
            );
            return next;
        }

        // Step budget exhausted: finish without consuming another step.
        if next.step_count >= next.max_steps {
            record_complete(&mut next, "step budget exhausted", false);
            return next;
        }

        let selection = match self.consult_model(&mut next, catalog).await {
            Some(selection) => selection,
            None => deterministic_selection(&next, catalog),
        };

        if selection.used_fallback {
            next.llm_usage.fallback_count = next.llm_usage.fallback_count.saturating_add(1);
        }

        if selection.tool == ACTION_COMPLETE {
            record_complete(&mut next, &selection.reason, selection.used_fallback);
            return next;
        }

        next.step_count = next.step_count.saturating_add(1);
        next.next_action = Some(selection.tool.clone());
        next.planner_decisions.push(PlannerDecision {
            step: next.step_count,
            selected_tool: selection.tool,
            reason: selection.reason,
            confidence: selection.confidence.clamp(0.0, 1.0),
            used_fallback: selection.used_fallback,
            timestamp: Utc::now(),
        });
        next
    }

    /// One LLM attempt. `None` means "use the deterministic fallback";
    /// the caller decides what that implies for `used_fallback`.
    async fn consult_model(
        &self,
        next: &mut InvestigationState,
        catalog: &[ToolSummary],
    ) -> Option<Selection> {
        // Quick mode and disabled-LLM runs plan deterministically by
        // design, which is not a fallback.
        if !self.settings.llm_enabled
            || !next.feature_flags.planner_llm_enabled
            || next.mode == InvestigationMode::Quick
        {
            return None;
        }
        let model = self.model.as_ref()?;

        let user = compose_user_prompt(next, catalog);
        if let Err(rejection) = self.guard.scan(&user) {
            tracing::warn!(error = %rejection, "planner prompt rejected by guard");
            return Some(fallback_with_reason(
                next,
                catalog,
                "prompt guard rejected the planning payload",
            ));
        }

        let request = ChatRequest {
            system: Some(SYSTEM_PROMPT.to_owned()),
            user,
            max_tokens: self.settings.max_completion_tokens,
            temperature: self.settings.temperature,
        };

        next.llm_usage.planner_calls = next.llm_usage.planner_calls.saturating_add(1);
        let response = match tokio::time::timeout(self.timeout, model.complete(&request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "planner llm call failed");
                return Some(fallback_with_reason(next, catalog, "llm call failed"));
            }
            Err(_) => {
                tracing::warn!("planner llm call timed out");
                return Some(fallback_with_reason(next, catalog, "llm call timed out"));
            }
        };

        next.llm_usage.total_prompt_tokens = next
            .llm_usage
            .total_prompt_tokens
            .saturating_add(response.prompt_tokens);
        next.llm_usage.total_completion_tokens = next
            .llm_usage
            .total_completion_tokens
            .saturating_add(response.completion_tokens);

        let choice: PlannerChoice = match parse_json_response(&response.content) {
            Ok(choice) => choice,
            Err(e) => {
                tracing::warn!(error = %e, "planner response unparseable");
                return Some(fallback_with_reason(next, catalog, "llm response malformed"));
            }
        };

        match validate_choice(next, catalog, choice) {
            Ok(selection) => Some(selection),
            Err(reason) => {
                tracing::warn!(reason, "planner choice rejected by constraints");
                Some(fallback_with_reason(next, catalog, reason))
            }
        }
    }
}

/// Apply the non-negotiable constraints to an LLM choice.
fn validate_choice(
    state: &InvestigationState,
    catalog: &[ToolSummary],
    choice: PlannerChoice,
) -> Result<Selection, &'static str> {
    let confidence = choice.confidence.clamp(0.0, 1.0);

    if choice.tool == ACTION_COMPLETE {
        return Ok(Selection {
            tool: ACTION_COMPLETE.to_owned(),
            reason: non_empty(choice.reason, "model chose to complete"),
            confidence,
            used_fallback: false,
        });
    }

    if !catalog.iter().any(|t| t.name == choice.tool) {
        return Err("llm selected an unknown tool");
    }
    if state.has_completed(&choice.tool) {
        return Err("llm selected an already-completed tool");
    }

    // Context first, regardless of what the model prefers.
    if state.context.is_none() && choice.tool != CONTEXT_TOOL {
        return Ok(Selection {
            tool: CONTEXT_TOOL.to_owned(),
            reason: "constraint override: context must be gathered first".to_owned(),
            confidence,
            used_fallback: false,
        });
    }

    if choice.tool == RECOMMENDATION_TOOL && state.reasoning.is_none() {
        return Err("recommendation_tool requires reasoning");
    }
    if choice.tool == RULE_DRAFT_TOOL && state.recommendations.is_empty() {
        return Err("rule_draft_tool requires recommendations");
    }

    Ok(Selection {
        tool: choice.tool,
        reason: non_empty(choice.reason, "model selection"),
        confidence,
        used_fallback: false,
    })
}

/// First valid tool from the canonical sequence, or COMPLETE.
fn deterministic_selection(state: &InvestigationState, catalog: &[ToolSummary]) -> Selection {
    match next_in_sequence(state, catalog) {
        Some(tool) => Selection {
            reason: format!("deterministic sequence selected {tool}"),
            tool: tool.to_owned(),
            confidence: 1.0,
            used_fallback: false,
        },
        None => Selection {
            tool: ACTION_COMPLETE.to_owned(),
            reason: "no valid tool remains".to_owned(),
            confidence: 1.0,
            used_fallback: false,
        },
    }
}

/// The deterministic choice, flagged as a fallback with a specific reason.
fn fallback_with_reason(
    state: &InvestigationState,
    catalog: &[ToolSummary],
    reason: &str,
) -> Selection {
    let mut selection = deterministic_selection(state, catalog);
    selection.reason = format!("fallback ({reason})");
    selection.used_fallback = true;
    selection
}

fn next_in_sequence(state: &InvestigationState, catalog: &[ToolSummary]) -> Option<&'static str> {
    FALLBACK_SEQUENCE.iter().copied().find(|name| {
        catalog.iter().any(|t| t.name == *name)
            && !state.has_completed(name)
            && prerequisites_met(state, name)
    })
}

fn prerequisites_met(state: &InvestigationState, tool: &str) -> bool {
    match tool {
        RECOMMENDATION_TOOL => state.reasoning.is_some(),
        RULE_DRAFT_TOOL => !state.recommendations.is_empty(),
        CONTEXT_TOOL => true,
        _ => true,
    }
}

fn compose_user_prompt(state: &InvestigationState, catalog: &[ToolSummary]) -> String {
    let snapshot = redact_state_for_prompt(state);
    let snapshot_json =
        serde_json::to_string_pretty(&snapshot).unwrap_or_else(|_| "{}".to_owned());
    let tools_json = serde_json::to_string_pretty(
        &catalog
            .iter()
            .map(|t| serde_json::json!({ "name": t.name, "description": t.description }))
            .collect::<Vec<_>>(),
    )
    .unwrap_or_else(|_| "[]".to_owned());

    format!(
        "## Investigation State\n{snapshot_json}\n\n\
         ## Available Tools\n{tools_json}\n\n\
         Select the next tool or COMPLETE."
    )
}

fn record_complete(state: &mut InvestigationState, reason: &str, used_fallback: bool) {
    state.next_action = Some(ACTION_COMPLETE.to_owned());
    state.planner_decisions.push(PlannerDecision {
        step: state.step_count,
        selected_tool: ACTION_COMPLETE.to_owned(),
        reason: reason.to_owned(),
        confidence: 1.0,
        used_fallback,
        timestamp: Utc::now(),
    });
}

fn non_empty(value: String, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_owned()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatResponse, LlmError};
    use crate::state::{FeatureFlagsSnapshot, SafeguardsSnapshot, Severity};
    use crate::state::{Reasoning, TransactionContext, WindowStats};
    use crate::tools::{PATTERN_TOOL, SIMILARITY_TOOL};
    use async_trait::async_trait;
    use uuid::Uuid;

    struct ScriptedModel {
        reply: String,
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse, LlmError> {
            Ok(ChatResponse {
                content: self.reply.clone(),
                prompt_tokens: 100,
                completion_tokens: 20,
                model: "scripted".to_owned(),
            })
        }

        fn model_id(&self) -> &str {
            "scripted"
        }
    }

    struct FailingModel;

    #[async_trait]
    impl ChatModel for FailingModel {
        async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse, LlmError> {
            Err(LlmError::Unavailable("down".to_owned()))
        }

        fn model_id(&self) -> &str {
            "failing"
        }
    }

    fn full_catalog() -> Vec<ToolSummary> {
        FALLBACK_SEQUENCE
            .iter()
            .map(|name| ToolSummary {
                name,
                description: "test tool",
            })
            .collect()
    }

    fn base_state(llm_enabled: bool) -> InvestigationState {
        InvestigationState::new(
            Uuid::new_v4(),
            "txn_p".to_owned(),
            InvestigationMode::Full,
            FeatureFlagsSnapshot {
                planner_llm_enabled: llm_enabled,
                vector_enabled: true,
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

    fn with_context(mut state: InvestigationState) -> InvestigationState {
        state.context = Some(TransactionContext {
            transaction: crate::state::Transaction {
                transaction_id: "txn_p".to_owned(),
                card_id: "tok_1234567890ab".to_owned(),
                merchant_id: "m_1".to_owned(),
                merchant_name: None,
                mcc: None,
                amount: 10.0,
                currency: "USD".to_owned(),
                outcome: "approved".to_owned(),
                three_ds_verified: false,
                device_trusted: false,
                occurred_at: Utc::now(),
            },
            card_history: vec![],
            merchant_history: vec![],
            matched_rules: vec![],
            review: None,
            notes: vec![],
            case: None,
            window_1h: WindowStats::default(),
            window_6h: WindowStats::default(),
            window_24h: WindowStats::default(),
            window_72h: WindowStats::default(),
        });
        state
    }

    fn planner(model: Option<Arc<dyn ChatModel>>) -> Planner {
        Planner::new(
            model,
            Arc::new(PromptGuard::new(true)),
            PlannerSettings::default(),
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn test_disabled_llm_uses_sequence_without_calls() {
        let p = planner(None);
        let mut state = base_state(false);

        let mut executed: Vec<String> = Vec::new();
        // Walk the whole plan deterministically.
        for _ in 0..10 {
            state = p.plan(&state, &full_catalog()).await;
            let action = state.next_action.clone().expect("action");
            if action == ACTION_COMPLETE {
                break;
            }
            executed.push(action.clone());
            // Simulate the executor: mark done and fill prerequisites.
            state.mark_completed(&action);
            if action == CONTEXT_TOOL {
                state = with_context(state);
            }
            if action == "reasoning_tool" {
                state.reasoning = Some(Reasoning {
                    risk_level: Severity::Low,
                    explanation: String::new(),
                    hypotheses: vec![],
                    confidence: 0.5,
                    llm_status: "fallback".to_owned(),
                });
            }
            if action == "recommendation_tool" {
                state.recommendations.push(crate::state::Recommendation {
                    id: Uuid::new_v4(),
                    kind: "standard_review".to_owned(),
                    priority: 1,
                    title: "t".to_owned(),
                    impact: "i".to_owned(),
                    payload: serde_json::json!({}),
                });
            }
        }

        assert_eq!(executed, FALLBACK_SEQUENCE.to_vec());
        assert_eq!(state.llm_usage.planner_calls, 0);
        assert_eq!(state.llm_usage.fallback_count, 0);
        // Final decision is COMPLETE once every tool has run.
        let last = state.planner_decisions.last().expect("decision");
        assert_eq!(last.selected_tool, ACTION_COMPLETE);
    }

    #[tokio::test]
    async fn test_empty_context_forces_context_tool() {
        let model: Arc<dyn ChatModel> = Arc::new(ScriptedModel {
            reply: r#"{"tool":"pattern_tool","reason":"skip ahead","confidence":0.9}"#.to_owned(),
        });
        let p = planner(Some(model));
        let state = base_state(true);
        let next = p.plan(&state, &full_catalog()).await;
        assert_eq!(next.next_action.as_deref(), Some(CONTEXT_TOOL));
        let decision = next.planner_decisions.last().expect("decision");
        assert!(!decision.used_fallback, "constraint override is not a fallback");
        assert_eq!(next.llm_usage.planner_calls, 1);
    }

    #[tokio::test]
    async fn test_unknown_tool_falls_back() {
        let model: Arc<dyn ChatModel> = Arc::new(ScriptedModel {
            reply: r#"{"tool":"teleport_tool","reason":"?","confidence":0.9}"#.to_owned(),
        });
        let p = planner(Some(model));
        let state = with_context(base_state(true));
        let mut state = state;
        state.mark_completed(CONTEXT_TOOL);

        let next = p.plan(&state, &full_catalog()).await;
        assert_eq!(next.next_action.as_deref(), Some(PATTERN_TOOL));
        let decision = next.planner_decisions.last().expect("decision");
        assert!(decision.used_fallback);
        assert!(decision.reason.contains("unknown tool"));
        assert_eq!(next.llm_usage.fallback_count, 1);
    }

    #[tokio::test]
    async fn test_repeated_tool_falls_back() {
        let model: Arc<dyn ChatModel> = Arc::new(ScriptedModel {
            reply: r#"{"tool":"context_tool","reason":"again","confidence":0.9}"#.to_owned(),
        });
        let p = planner(Some(model));
        let mut state = with_context(base_state(true));
        state.mark_completed(CONTEXT_TOOL);

        let next = p.plan(&state, &full_catalog()).await;
        assert_eq!(next.next_action.as_deref(), Some(PATTERN_TOOL));
        assert!(next.planner_decisions.last().expect("d").used_fallback);
    }

    #[tokio::test]
    async fn test_malformed_response_falls_back() {
        let model: Arc<dyn ChatModel> = Arc::new(ScriptedModel {
            reply: "sure, let me think about that".to_owned(),
        });
        let p = planner(Some(model));
        let state = base_state(true);
        let next = p.plan(&state, &full_catalog()).await;
        assert_eq!(next.next_action.as_deref(), Some(CONTEXT_TOOL));
        let decision = next.planner_decisions.last().expect("decision");
        assert!(decision.used_fallback);
        assert!(decision.reason.contains("malformed"));
    }

    #[tokio::test]
    async fn test_llm_outage_falls_back_with_reason() {
        let p = planner(Some(Arc::new(FailingModel)));
        let state = base_state(true);
        let next = p.plan(&state, &full_catalog()).await;
        assert_eq!(next.next_action.as_deref(), Some(CONTEXT_TOOL));
        let decision = next.planner_decisions.last().expect("decision");
        assert!(decision.used_fallback);
        assert!(decision.reason.contains("llm call failed"));
        assert_eq!(next.llm_usage.fallback_count, 1);
    }

    #[tokio::test]
    async fn test_step_budget_exhaustion_completes_without_increment() {
        let p = planner(None);
        let mut state = with_context(base_state(false));
        state.max_steps = 1;
        state.step_count = 1;
        let next = p.plan(&state, &full_catalog()).await;
        assert_eq!(next.next_action.as_deref(), Some(ACTION_COMPLETE));
        assert_eq!(next.step_count, 1, "COMPLETE must not consume a step");
    }

    #[tokio::test]
    async fn test_all_tools_done_means_complete() {
        let p = planner(None);
        let mut state = with_context(base_state(false));
        for name in FALLBACK_SEQUENCE {
            state.mark_completed(name);
        }
        let next = p.plan(&state, &full_catalog()).await;
        assert_eq!(next.next_action.as_deref(), Some(ACTION_COMPLETE));
    }

    #[tokio::test]
    async fn test_failed_context_terminates_as_failed() {
        let p = planner(None);
        let mut state = base_state(false);
        state.mark_completed(CONTEXT_TOOL); // ran, but produced nothing
        let next = p.plan(&state, &full_catalog()).await;
        assert_eq!(next.next_action.as_deref(), Some(ACTION_COMPLETE));
        assert!(next.error.is_some());
    }

    #[tokio::test]
    async fn test_quick_mode_never_calls_llm() {
        let model: Arc<dyn ChatModel> = Arc::new(ScriptedModel {
            reply: r#"{"tool":"context_tool","confidence":1.0}"#.to_owned(),
        });
        let p = planner(Some(model));
        let mut state = base_state(true);
        state.mode = InvestigationMode::Quick;
        let catalog: Vec<ToolSummary> = full_catalog()
            .into_iter()
            .filter(|t| t.name != SIMILARITY_TOOL && t.name != RULE_DRAFT_TOOL)
            .collect();
        let next = p.plan(&state, &catalog).await;
        assert_eq!(next.llm_usage.planner_calls, 0);
        assert_eq!(next.next_action.as_deref(), Some(CONTEXT_TOOL));
    }

    #[tokio::test]
    async fn test_quick_mode_sequence_skips_excluded_tools() {
        let p = planner(None);
        let mut state = with_context(base_state(false));
        state.mode = InvestigationMode::Quick;
        state.mark_completed(CONTEXT_TOOL);
        state.mark_completed(PATTERN_TOOL);
        let catalog: Vec<ToolSummary> = full_catalog()
            .into_iter()
            .filter(|t| t.name != SIMILARITY_TOOL && t.name != RULE_DRAFT_TOOL)
            .collect();
        let next = p.plan(&state, &catalog).await;
        assert_eq!(next.next_action.as_deref(), Some("reasoning_tool"));
    }

    #[tokio::test]
    async fn test_step_count_increments_per_selection() {
        let p = planner(None);
        let state = base_state(false);
        let next = p.plan(&state, &full_catalog()).await;
        assert_eq!(next.step_count, 1);
        assert_eq!(next.planner_decisions.len(), 1);
        assert_eq!(next.planner_decisions[0].step, 1);
        assert_eq!(next.status, InvestigationStatus::InProgress);
    }
}
