//! Core investigation state and the record types that flow through it.
//!
//! [`InvestigationState`] is the working memory handed from node to node in
//! the agent graph. Nodes never mutate a state in place: they clone, write
//! into the clone, and return it, so any persisted snapshot is a valid
//! resume point. Everything here is strict JSON — timestamps serialize as
//! RFC 3339 strings and there are no binary payloads.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Enumerations ────────────────────────────────────────────────

/// Investigation execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvestigationMode {
    /// All six tools, LLM planner and LLM reasoning available.
    Full,
    /// Deterministic planner only; similarity and rule-draft tools excluded.
    Quick,
}

impl InvestigationMode {
    /// Stable string form used in persistence and idempotency keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::Quick => "QUICK",
        }
    }

    /// Parse from the stable string form (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "FULL" => Some(Self::Full),
            "QUICK" => Some(Self::Quick),
            _ => None,
        }
    }
}

/// Lifecycle status of an investigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvestigationStatus {
    /// Row created, graph not yet entered.
    Pending,
    /// Planner has run at least once.
    InProgress,
    /// Terminal: completion node finished normally.
    Completed,
    /// Terminal: unrecoverable failure (e.g. no context obtainable).
    Failed,
    /// Terminal: outer deadline elapsed.
    TimedOut,
}

impl InvestigationStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    /// Stable string form used in persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
        }
    }

    /// Parse from the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "TIMED_OUT" => Some(Self::TimedOut),
            _ => None,
        }
    }
}

/// Severity levels ordered lowest to highest risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// No meaningful fraud signal.
    Low,
    /// Some signal; routine review.
    Medium,
    /// Strong signal; prioritized review.
    High,
    /// Immediate action warranted.
    Critical,
}

impl Severity {
    /// Stable string form used in persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    /// Parse from the stable string form (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "LOW" => Some(Self::Low),
            "MEDIUM" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Outcome of a single tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolStatus {
    /// Tool returned a new state.
    Success,
    /// Tool raised an error.
    Failed,
    /// Tool exceeded the per-tool deadline.
    TimedOut,
}

impl ToolStatus {
    /// Stable string form used in persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
        }
    }
}

// ── Audit records ───────────────────────────────────────────────

/// One tool execution, recorded by the executor in all outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecution {
    /// Registered tool name.
    pub tool_name: String,
    /// Planner step that selected this tool.
    pub step_number: u32,
    /// Outcome.
    pub status: ToolStatus,
    /// Short description of what the tool was given.
    pub input_summary: String,
    /// Short description of what the tool produced.
    pub output_summary: String,
    /// Wall-clock execution time.
    pub execution_time_ms: u64,
    /// Sanitized error message for FAILED / TIMED_OUT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When the execution finished.
    pub timestamp: DateTime<Utc>,
}

/// One planner decision, recorded on every planner invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerDecision {
    /// Step number this decision produced.
    pub step: u32,
    /// Tool name or `"COMPLETE"`.
    pub selected_tool: String,
    /// Why the planner chose it.
    pub reason: String,
    /// Planner confidence in [0, 1].
    pub confidence: f64,
    /// Whether the deterministic fallback produced this decision.
    pub used_fallback: bool,
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
}

// ── Context ─────────────────────────────────────────────────────

/// A transaction after field translation from the TM wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// External transaction identifier.
    pub transaction_id: String,
    /// Tokenized card identifier.
    pub card_id: String,
    /// Merchant identifier.
    pub merchant_id: String,
    /// Merchant display name, when the TM API supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_name: Option<String>,
    /// Merchant category code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcc: Option<String>,
    /// Amount in major currency units.
    pub amount: f64,
    /// ISO currency code.
    pub currency: String,
    /// Processing outcome ("approved", "declined", ...).
    pub outcome: String,
    /// Whether 3-D Secure verification passed.
    #[serde(default)]
    pub three_ds_verified: bool,
    /// Whether the device is on the cardholder's trusted list.
    #[serde(default)]
    pub device_trusted: bool,
    /// When the transaction occurred.
    pub occurred_at: DateTime<Utc>,
}

impl Transaction {
    /// Whether this transaction was declined.
    pub fn is_declined(&self) -> bool {
        self.outcome.eq_ignore_ascii_case("declined")
    }
}

/// Aggregate statistics over one look-back window, anchored to the
/// target transaction's timestamp (never wall clock).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    /// Transactions in the window, target included.
    pub transaction_count: u32,
    /// Sum of amounts in the window.
    pub total_amount: f64,
    /// Distinct merchants in the window.
    pub unique_merchants: u32,
    /// Declined transactions in the window.
    pub decline_count: u32,
}

/// Evidence gathered by the context tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionContext {
    /// The transaction under investigation.
    pub transaction: Transaction,
    /// Card activity in the 72 h window.
    pub card_history: Vec<Transaction>,
    /// Merchant activity in the 72 h window.
    pub merchant_history: Vec<Transaction>,
    /// Fraud rules that matched at authorization time.
    pub matched_rules: Vec<serde_json::Value>,
    /// Open review attached to the transaction, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<serde_json::Value>,
    /// Analyst notes.
    #[serde(default)]
    pub notes: Vec<serde_json::Value>,
    /// Linked case, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case: Option<serde_json::Value>,
    /// 1-hour window statistics.
    pub window_1h: WindowStats,
    /// 6-hour window statistics.
    pub window_6h: WindowStats,
    /// 24-hour window statistics.
    pub window_24h: WindowStats,
    /// 72-hour window statistics.
    pub window_72h: WindowStats,
}

// ── Evidence ────────────────────────────────────────────────────

/// A tool-authored evidence record appended to the flat evidence list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceEnvelope {
    /// Evidence category (e.g. "pattern_analysis").
    pub category: String,
    /// Tool that produced it.
    pub tool: String,
    /// One-line description.
    pub description: String,
    /// Structured payload.
    pub data: serde_json::Value,
}

/// Score for one detection pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternScore {
    /// Pattern name (e.g. "velocity").
    pub name: String,
    /// Score in [0, 1].
    pub score: f64,
    /// Aggregation weight in [0, 1].
    pub weight: f64,
    /// Detector-specific detail payload.
    pub details: serde_json::Value,
}

/// Output of the pattern tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternResults {
    /// Per-detector scores.
    pub scores: Vec<PatternScore>,
    /// Weighted mean of detector scores.
    pub overall_score: f64,
    /// Names of detectors whose score exceeded 0.5.
    pub patterns_detected: Vec<String>,
}

/// One nearest-neighbor hit from the vector search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityMatch {
    /// Matched transaction identifier.
    pub transaction_id: String,
    /// Raw cosine similarity in [0, 1].
    pub similarity: f64,
    /// Age of the match at query time, in days.
    pub age_days: f64,
    /// Similarity after freshness decay.
    pub weighted_score: f64,
}

/// Output of the similarity tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityResults {
    /// Retained neighbor matches, strongest first.
    pub matches: Vec<SimilarityMatch>,
    /// Strongest weighted score, 0 when no match.
    pub overall_score: f64,
    /// True only when vector search is disabled by configuration.
    #[serde(default)]
    pub skipped: bool,
}

/// Output of the reasoning tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reasoning {
    /// Normalized risk level.
    pub risk_level: Severity,
    /// Narrative explanation, truncated to 2,000 characters.
    pub explanation: String,
    /// Hypotheses, at most 10.
    pub hypotheses: Vec<String>,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// `"llm"` when the model produced this, `"fallback"` otherwise.
    pub llm_status: String,
}

/// An analyst-facing suggested action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    /// Stable identifier, generated when the recommendation is built.
    pub id: Uuid,
    /// Recommendation type (e.g. "velocity_review").
    #[serde(rename = "type")]
    pub kind: String,
    /// Priority, 1 is highest.
    pub priority: u32,
    /// Short actionable title.
    pub title: String,
    /// Expected impact description.
    pub impact: String,
    /// Context needed to act without re-querying.
    pub payload: serde_json::Value,
}

/// A normalized rule condition tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Field the condition applies to.
    pub field_name: String,
    /// Comparison operator.
    pub operator: String,
    /// Comparison value.
    pub value: serde_json::Value,
    /// Connective to the next condition ("AND" / "OR").
    pub logical_op: String,
}

/// Provenance carried by a rule draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDraftMetadata {
    /// Recommendation the draft was derived from.
    pub recommendation_id: Uuid,
    /// Idempotency key of the owning insight.
    pub insight_key: String,
    /// Fixed provenance marker.
    pub source: String,
}

/// A human-reviewable rule proposal. Never exported automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDraftPayload {
    /// Proposed rule name.
    pub rule_name: String,
    /// Proposed rule description.
    pub rule_description: String,
    /// Normalized conditions.
    pub conditions: Vec<RuleCondition>,
    /// Named thresholds referenced by the conditions.
    pub thresholds: BTreeMap<String, f64>,
    /// Provenance.
    pub metadata: RuleDraftMetadata,
}

// ── Runtime snapshots ───────────────────────────────────────────

/// Feature flags frozen into the state at creation, for audit replay.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeatureFlagsSnapshot {
    /// LLM-driven planning enabled.
    pub planner_llm_enabled: bool,
    /// Vector similarity search enabled.
    pub vector_enabled: bool,
    /// Prompt guard enabled.
    pub prompt_guard_enabled: bool,
    /// Rule draft export to rule management enabled.
    pub rule_draft_export_enabled: bool,
}

/// Safeguard budgets frozen into the state at creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SafeguardsSnapshot {
    /// Outer deadline for the whole run, seconds.
    pub investigation_timeout_seconds: u64,
    /// Per-tool deadline, seconds.
    pub tool_timeout_seconds: u64,
    /// Per-planner-call deadline, seconds.
    pub planner_timeout_seconds: u64,
    /// Step cap.
    pub max_steps: u32,
}

/// LLM usage counters accumulated during the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmUsage {
    /// Planner LLM invocations.
    pub planner_calls: u32,
    /// Reasoning LLM invocations.
    pub reasoning_calls: u32,
    /// Total prompt tokens across all calls.
    pub total_prompt_tokens: u64,
    /// Total completion tokens across all calls.
    pub total_completion_tokens: u64,
    /// Times a deterministic fallback replaced an LLM result.
    pub fallback_count: u32,
    /// Model identifier configured for the run.
    pub model: String,
}

/// TM API usage counters accumulated during the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TmApiUsage {
    /// Total TM calls issued.
    pub total_calls: u32,
    /// Distinct endpoints called, in first-call order.
    pub endpoints_called: Vec<String>,
}

impl TmApiUsage {
    /// Record one call to an endpoint.
    pub fn record(&mut self, endpoint: &str) {
        self.total_calls = self.total_calls.saturating_add(1);
        if !self.endpoints_called.iter().any(|e| e == endpoint) {
            self.endpoints_called.push(endpoint.to_owned());
        }
    }
}

// ── InvestigationState ──────────────────────────────────────────

/// Sentinel action name the planner emits to finish the run.
pub const ACTION_COMPLETE: &str = "COMPLETE";

/// The working memory of one investigation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestigationState {
    /// Opaque stable identifier for this run.
    pub investigation_id: Uuid,
    /// Transaction under investigation.
    pub transaction_id: String,
    /// Execution mode.
    pub mode: InvestigationMode,

    /// Context evidence, absent until the context tool has run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<TransactionContext>,
    /// Pattern scoring output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_results: Option<PatternResults>,
    /// Similarity search output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_results: Option<SimilarityResults>,
    /// Narrative reasoning output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Reasoning>,
    /// Ordered recommendations.
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
    /// Draft detection rule, if one was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_draft: Option<RuleDraftPayload>,
    /// Flat list of tool-authored evidence envelopes.
    #[serde(default)]
    pub evidence: Vec<EvidenceEnvelope>,

    /// Current confidence estimate in [0, 1].
    pub confidence_score: f64,
    /// Current severity estimate.
    pub severity: Severity,
    /// Accumulated hypotheses.
    #[serde(default)]
    pub hypotheses: Vec<String>,

    /// Lifecycle status.
    pub status: InvestigationStatus,
    /// Tool names already executed, in execution order.
    #[serde(default)]
    pub completed_steps: Vec<String>,
    /// Tool the planner selected for the next step, or `COMPLETE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<String>,
    /// Planner steps taken so far.
    pub step_count: u32,
    /// Step cap for this run.
    pub max_steps: u32,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Terminal error description, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Every planner decision, in order.
    #[serde(default)]
    pub planner_decisions: Vec<PlannerDecision>,
    /// Every tool execution, in order.
    #[serde(default)]
    pub tool_executions: Vec<ToolExecution>,

    /// LLM usage counters.
    #[serde(default)]
    pub llm_usage: LlmUsage,
    /// TM usage counters.
    #[serde(default)]
    pub tm_usage: TmApiUsage,

    /// Feature flags in effect when the run started.
    pub feature_flags: FeatureFlagsSnapshot,
    /// Safeguard budgets in effect when the run started.
    pub safeguards: SafeguardsSnapshot,
}

impl InvestigationState {
    /// Build the initial state for a new investigation.
    pub fn new(
        investigation_id: Uuid,
        transaction_id: String,
        mode: InvestigationMode,
        flags: FeatureFlagsSnapshot,
        safeguards: SafeguardsSnapshot,
        planner_model: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            investigation_id,
            transaction_id,
            mode,
            context: None,
            pattern_results: None,
            similarity_results: None,
            reasoning: None,
            recommendations: Vec::new(),
            rule_draft: None,
            evidence: Vec::new(),
            confidence_score: 0.0,
            severity: Severity::Low,
            hypotheses: Vec::new(),
            status: InvestigationStatus::Pending,
            completed_steps: Vec::new(),
            next_action: None,
            step_count: 0,
            max_steps: safeguards.max_steps,
            started_at,
            completed_at: None,
            error: None,
            planner_decisions: Vec::new(),
            tool_executions: Vec::new(),
            llm_usage: LlmUsage {
                model: planner_model,
                ..LlmUsage::default()
            },
            tm_usage: TmApiUsage::default(),
            feature_flags: flags,
            safeguards,
        }
    }

    /// Whether a tool has already executed in this run.
    pub fn has_completed(&self, tool_name: &str) -> bool {
        self.completed_steps.iter().any(|t| t == tool_name)
    }

    /// Mark a tool as executed. Idempotent: a name is recorded once.
    pub fn mark_completed(&mut self, tool_name: &str) {
        if !self.has_completed(tool_name) {
            self.completed_steps.push(tool_name.to_owned());
        }
    }

    /// Append a hypothesis, skipping duplicates.
    pub fn add_hypothesis(&mut self, hypothesis: &str) {
        if !self.hypotheses.iter().any(|h| h == hypothesis) {
            self.hypotheses.push(hypothesis.to_owned());
        }
    }

    /// Evidence buckets that remain empty despite the run finishing.
    ///
    /// Used for the `evidence_gaps` field of the trace envelope.
    pub fn evidence_gaps(&self) -> Vec<String> {
        let mut gaps = Vec::new();
        if self.context.is_none() {
            gaps.push("context".to_owned());
        }
        if self.pattern_results.is_none() {
            gaps.push("pattern_results".to_owned());
        }
        let similarity_skipped = self
            .similarity_results
            .as_ref()
            .map(|s| s.skipped)
            .unwrap_or(true);
        if similarity_skipped && self.feature_flags.vector_enabled {
            gaps.push("similarity_results".to_owned());
        }
        if self.reasoning.is_none() {
            gaps.push("reasoning".to_owned());
        }
        if self.recommendations.is_empty() {
            gaps.push("recommendations".to_owned());
        }
        gaps
    }
}
