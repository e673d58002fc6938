//! Reasoning tool: LLM narrative risk assessment with deterministic
//! fallback.
//!
//! The model sees only a redacted state snapshot. Its output is parsed
//! strictly, sanitized (risk normalization, confidence clamp, narrative
//! and hypothesis caps, sensitive-key strip), and may be discarded: any
//! failure maps the pattern score onto a risk level instead, annotated
//! `llm_status = "fallback"`.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use crate::config::LlmSettings;
use crate::llm::{parse_json_response, ChatModel, ChatRequest};
use crate::redaction::{redact_state_for_prompt, sanitize_value, PromptGuard};
use crate::state::{EvidenceEnvelope, InvestigationState, Reasoning, Severity};

use super::{ToolError, REASONING_TOOL};

/// Maximum narrative length retained from the model.
const MAX_EXPLANATION_CHARS: usize = 2_000;

/// Maximum hypotheses retained from the model.
const MAX_HYPOTHESES: usize = 10;

/// Sampling temperature for reasoning calls.
const REASONING_TEMPERATURE: f64 = 0.2;

const SYSTEM_PROMPT: &str = "\
You are a card fraud analyst. You receive a redacted evidence snapshot for \
one transaction: context statistics, deterministic pattern scores, and \
similar historical cases. Assess the fraud risk.

Respond with ONLY a JSON object:
{
  \"risk_level\": \"CRITICAL\" | \"HIGH\" | \"MEDIUM\" | \"LOW\",
  \"explanation\": \"concise narrative grounded in the evidence\",
  \"hypotheses\": [\"...\"],
  \"confidence\": 0.0
}
Do not include any other keys or commentary.";

#[derive(Debug, Deserialize)]
struct RawAssessment {
    #[serde(default)]
    risk_level: String,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    hypotheses: Vec<String>,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

/// LLM-backed narrative reasoning with deterministic fallback.
pub struct ReasoningTool {
    model: Option<Arc<dyn ChatModel>>,
    guard: Arc<PromptGuard>,
    settings: LlmSettings,
}

impl ReasoningTool {
    /// Create the tool. Passing `None` for the model forces the
    /// deterministic fallback on every run.
    pub fn new(
        model: Option<Arc<dyn ChatModel>>,
        guard: Arc<PromptGuard>,
        settings: LlmSettings,
    ) -> Self {
        Self {
            model,
            guard,
            settings,
        }
    }

    /// Produce reasoning into a new state.
    pub async fn execute(
        &self,
        state: &InvestigationState,
    ) -> Result<InvestigationState, ToolError> {
        let mut next = state.clone();

        let reasoning = match self.consult_model(state, &mut next).await {
            Some(reasoning) => reasoning,
            None => {
                next.llm_usage.fallback_count = next.llm_usage.fallback_count.saturating_add(1);
                fallback_reasoning(state)
            }
        };

        for hypothesis in &reasoning.hypotheses {
            next.add_hypothesis(hypothesis);
        }
        if reasoning.risk_level > next.severity {
            next.severity = reasoning.risk_level;
        }
        next.confidence_score = reasoning.confidence;

        next.evidence.push(EvidenceEnvelope {
            category: "llm_reasoning".to_owned(),
            tool: REASONING_TOOL.to_owned(),
            description: format!(
                "risk {} via {} (confidence {:.2})",
                reasoning.risk_level.as_str(),
                reasoning.llm_status,
                reasoning.confidence
            ),
            data: json!({
                "risk_level": reasoning.risk_level,
                "llm_status": reasoning.llm_status,
                "hypothesis_count": reasoning.hypotheses.len(),
            }),
        });
        next.reasoning = Some(reasoning);

        Ok(next)
    }

    /// One model attempt; `None` means "use the fallback".
    async fn consult_model(
        &self,
        state: &InvestigationState,
        next: &mut InvestigationState,
    ) -> Option<Reasoning> {
        if !state.feature_flags.planner_llm_enabled {
            return None;
        }
        let model = self.model.as_ref()?;

        let snapshot = redact_state_for_prompt(state);
        let payload = json!({
            "context_redacted": snapshot.get("context"),
            "pattern_results": state.pattern_results,
            "similarity_results": state.similarity_results,
            "hypotheses": state.hypotheses,
        });
        let user = serde_json::to_string_pretty(&payload).ok()?;

        if let Err(rejection) = self.guard.scan(&user) {
            tracing::warn!(error = %rejection, "reasoning payload rejected by prompt guard");
            return None;
        }

        let request = ChatRequest {
            system: Some(SYSTEM_PROMPT.to_owned()),
            user,
            max_tokens: self.settings.max_completion_tokens,
            temperature: REASONING_TEMPERATURE,
        };

        let response = match model.complete(&request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "reasoning llm call failed, falling back");
                return None;
            }
        };

        next.llm_usage.reasoning_calls = next.llm_usage.reasoning_calls.saturating_add(1);
        next.llm_usage.total_prompt_tokens = next
            .llm_usage
            .total_prompt_tokens
            .saturating_add(response.prompt_tokens);
        next.llm_usage.total_completion_tokens = next
            .llm_usage
            .total_completion_tokens
            .saturating_add(response.completion_tokens);

        match sanitize_assessment(&response.content) {
            Ok(reasoning) => Some(reasoning),
            Err(e) => {
                tracing::warn!(error = %e, "reasoning output invalid, falling back");
                None
            }
        }
    }
}

/// Parse and sanitize a model assessment.
fn sanitize_assessment(content: &str) -> Result<Reasoning, ToolError> {
    // Strip denylisted keys before typed parsing.
    let raw_value: serde_json::Value = parse_json_response(content)
        .map_err(|e| ToolError::Dependency(e.to_string()))?;
    let cleaned = sanitize_value(&raw_value);
    let raw: RawAssessment = serde_json::from_value(cleaned)
        .map_err(|e| ToolError::Dependency(format!("assessment shape: {e}")))?;

    let risk_level = Severity::parse(&raw.risk_level).unwrap_or(Severity::Medium);
    let confidence = raw.confidence.clamp(0.0, 1.0);
    let explanation = crate::redaction::truncate_on_boundary(&raw.explanation, MAX_EXPLANATION_CHARS)
        .to_owned();
    let hypotheses: Vec<String> = raw
        .hypotheses
        .into_iter()
        .take(MAX_HYPOTHESES)
        .collect();

    Ok(Reasoning {
        risk_level,
        explanation,
        hypotheses,
        confidence,
        llm_status: "llm".to_owned(),
    })
}

/// Deterministic assessment from the pattern score alone.
fn fallback_reasoning(state: &InvestigationState) -> Reasoning {
    let overall = state
        .pattern_results
        .as_ref()
        .map(|p| p.overall_score)
        .unwrap_or(0.0);
    let risk_level = if overall >= 0.7 {
        Severity::High
    } else if overall >= 0.4 {
        Severity::Medium
    } else {
        Severity::Low
    };
    let detected = state
        .pattern_results
        .as_ref()
        .map(|p| p.patterns_detected.join(", "))
        .unwrap_or_default();
    let explanation = if detected.is_empty() {
        format!("Deterministic assessment: pattern score {overall:.2}, no patterns detected.")
    } else {
        format!("Deterministic assessment: pattern score {overall:.2}, detected: {detected}.")
    };

    Reasoning {
        risk_level,
        explanation,
        hypotheses: Vec::new(),
        confidence: (0.3 + overall * 0.5).min(0.8),
        llm_status: "fallback".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatResponse, LlmError};
    use crate::state::{
        FeatureFlagsSnapshot, InvestigationMode, PatternResults, SafeguardsSnapshot,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    struct ScriptedModel {
        reply: Result<String, ()>,
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse, LlmError> {
            match &self.reply {
                Ok(content) => Ok(ChatResponse {
                    content: content.clone(),
                    prompt_tokens: 120,
                    completion_tokens: 40,
                    model: "scripted".to_owned(),
                }),
                Err(()) => Err(LlmError::Unavailable("scripted outage".to_owned())),
            }
        }

        fn model_id(&self) -> &str {
            "scripted"
        }
    }

    fn state_with_patterns(overall: f64) -> InvestigationState {
        let mut state = InvestigationState::new(
            Uuid::new_v4(),
            "txn_r".to_owned(),
            InvestigationMode::Full,
            FeatureFlagsSnapshot {
                planner_llm_enabled: true,
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
        );
        state.pattern_results = Some(PatternResults {
            scores: vec![],
            overall_score: overall,
            patterns_detected: vec!["velocity".to_owned()],
        });
        state
    }

    fn tool(model: Option<Arc<dyn ChatModel>>) -> ReasoningTool {
        ReasoningTool::new(model, Arc::new(PromptGuard::new(true)), LlmSettings::default())
    }

    #[tokio::test]
    async fn test_valid_llm_output_is_used() {
        let reply = r#"{"risk_level":"HIGH","explanation":"burst of activity","hypotheses":["stolen card"],"confidence":0.9}"#;
        let tool = tool(Some(Arc::new(ScriptedModel {
            reply: Ok(reply.to_owned()),
        })));
        let state = state_with_patterns(0.5);
        let next = tool.execute(&state).await.expect("execute");
        let reasoning = next.reasoning.expect("reasoning");
        assert_eq!(reasoning.llm_status, "llm");
        assert_eq!(reasoning.risk_level, Severity::High);
        assert_eq!(next.llm_usage.reasoning_calls, 1);
        assert_eq!(next.llm_usage.fallback_count, 0);
        assert_eq!(next.llm_usage.total_prompt_tokens, 120);
        assert!(next.hypotheses.contains(&"stolen card".to_owned()));
        assert_eq!(next.severity, Severity::High);
    }

    #[tokio::test]
    async fn test_llm_outage_falls_back_deterministically() {
        let tool = tool(Some(Arc::new(ScriptedModel { reply: Err(()) })));
        let state = state_with_patterns(0.5);
        let next = tool.execute(&state).await.expect("execute");
        let reasoning = next.reasoning.expect("reasoning");
        assert_eq!(reasoning.llm_status, "fallback");
        assert_eq!(reasoning.risk_level, Severity::Medium);
        assert_eq!(next.llm_usage.fallback_count, 1);
        assert_eq!(next.llm_usage.reasoning_calls, 0);
    }

    #[tokio::test]
    async fn test_invalid_output_falls_back() {
        let tool = tool(Some(Arc::new(ScriptedModel {
            reply: Ok("I refuse to answer in JSON".to_owned()),
        })));
        let state = state_with_patterns(0.8);
        let next = tool.execute(&state).await.expect("execute");
        let reasoning = next.reasoning.expect("reasoning");
        assert_eq!(reasoning.llm_status, "fallback");
        assert_eq!(reasoning.risk_level, Severity::High);
        // The call itself happened and is counted; the output was discarded.
        assert_eq!(next.llm_usage.reasoning_calls, 1);
        assert_eq!(next.llm_usage.fallback_count, 1);
    }

    #[tokio::test]
    async fn test_llm_disabled_never_calls_model() {
        let tool = tool(Some(Arc::new(ScriptedModel {
            reply: Ok("{}".to_owned()),
        })));
        let mut state = state_with_patterns(0.2);
        state.feature_flags.planner_llm_enabled = false;
        let next = tool.execute(&state).await.expect("execute");
        assert_eq!(next.llm_usage.reasoning_calls, 0);
        assert_eq!(next.reasoning.expect("reasoning").llm_status, "fallback");
    }

    #[test]
    fn test_sanitize_normalizes_unknown_risk() {
        let reasoning =
            sanitize_assessment(r#"{"risk_level":"BANANAS","confidence":3.5}"#).expect("parse");
        assert_eq!(reasoning.risk_level, Severity::Medium);
        assert!((reasoning.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sanitize_caps_narrative_and_hypotheses() {
        let long = "x".repeat(5_000);
        let hyps: Vec<String> = (0..20).map(|i| format!("h{i}")).collect();
        let raw = serde_json::json!({
            "risk_level": "LOW",
            "explanation": long,
            "hypotheses": hyps,
            "confidence": 0.5,
        })
        .to_string();
        let reasoning = sanitize_assessment(&raw).expect("parse");
        assert_eq!(reasoning.explanation.len(), MAX_EXPLANATION_CHARS);
        assert_eq!(reasoning.hypotheses.len(), MAX_HYPOTHESES);
    }

    #[test]
    fn test_sanitize_strips_sensitive_keys() {
        let raw = r#"{"risk_level":"LOW","confidence":0.4,"system":"injected","api_token":"x"}"#;
        // Parsing succeeds; the denylisted keys are simply dropped before
        // the typed decode, so they can never reach persisted state.
        let reasoning = sanitize_assessment(raw).expect("parse");
        assert_eq!(reasoning.risk_level, Severity::Low);
    }

    #[test]
    fn test_fallback_thresholds() {
        let state = state_with_patterns(0.75);
        assert_eq!(fallback_reasoning(&state).risk_level, Severity::High);
        let state = state_with_patterns(0.45);
        assert_eq!(fallback_reasoning(&state).risk_level, Severity::Medium);
        let state = state_with_patterns(0.1);
        assert_eq!(fallback_reasoning(&state).risk_level, Severity::Low);
    }
}
