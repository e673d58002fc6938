//! The evidence-producing tool suite.
//!
//! Six concrete tools behind one closed [`AgentTool`] enum: context,
//! pattern, similarity, reasoning, recommendation, rule draft. Every tool
//! obeys the same contract: deterministic given its inputs, idempotent
//! (re-running replaces its own fields), never plans, never persists.
//! Side effects are limited to HTTP calls to pre-declared collaborators
//! and returning a new state value.

use thiserror::Error;

use crate::state::{InvestigationMode, InvestigationState};

pub mod context;
pub mod pattern;
pub mod recommendation;
pub mod reasoning;
pub mod rule_draft;
pub mod similarity;

pub use context::ContextTool;
pub use pattern::PatternTool;
pub use recommendation::RecommendationTool;
pub use reasoning::ReasoningTool;
pub use rule_draft::RuleDraftTool;
pub use similarity::SimilarityTool;

/// Registered name of the context tool.
pub const CONTEXT_TOOL: &str = "context_tool";
/// Registered name of the pattern tool.
pub const PATTERN_TOOL: &str = "pattern_tool";
/// Registered name of the similarity tool.
pub const SIMILARITY_TOOL: &str = "similarity_tool";
/// Registered name of the reasoning tool.
pub const REASONING_TOOL: &str = "reasoning_tool";
/// Registered name of the recommendation tool.
pub const RECOMMENDATION_TOOL: &str = "recommendation_tool";
/// Registered name of the rule draft tool.
pub const RULE_DRAFT_TOOL: &str = "rule_draft_tool";

/// Canonical deterministic tool order, used by the planner fallback.
pub const FALLBACK_SEQUENCE: [&str; 6] = [
    CONTEXT_TOOL,
    PATTERN_TOOL,
    SIMILARITY_TOOL,
    REASONING_TOOL,
    RECOMMENDATION_TOOL,
    RULE_DRAFT_TOOL,
];

/// Deterministic key identifying the insight produced for a transaction
/// and mode. Re-running the same investigation maps to the same key.
pub fn insight_idempotency_key(transaction_id: &str, mode: InvestigationMode) -> String {
    format!("ops-agent:{}:{}", transaction_id, mode.as_str())
}

/// Errors raised by tools; the executor converts them into FAILED
/// execution records, never into runtime errors.
#[derive(Debug, Error)]
pub enum ToolError {
    /// An external collaborator failed after retries.
    #[error("dependency failure: {0}")]
    Dependency(String),
    /// A required state field was absent.
    #[error("missing input: {0}")]
    MissingInput(String),
    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl From<crate::tm::TmError> for ToolError {
    fn from(e: crate::tm::TmError) -> Self {
        ToolError::Dependency(e.to_string())
    }
}

impl From<crate::llm::LlmError> for ToolError {
    fn from(e: crate::llm::LlmError) -> Self {
        ToolError::Dependency(e.to_string())
    }
}

impl From<crate::llm::EmbedderError> for ToolError {
    fn from(e: crate::llm::EmbedderError) -> Self {
        ToolError::Dependency(e.to_string())
    }
}

impl From<crate::error::StoreError> for ToolError {
    fn from(e: crate::error::StoreError) -> Self {
        ToolError::Dependency(e.to_string())
    }
}

/// Name and one-line description shown to the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolSummary {
    /// Registered tool name.
    pub name: &'static str,
    /// One-line description for the planner prompt.
    pub description: &'static str,
}

/// The closed set of tools. A tagged enum rather than trait objects: the
/// suite is fixed, and matching on it keeps dispatch and summaries in one
/// place.
pub enum AgentTool {
    /// Fetches transaction context from TM.
    Context(ContextTool),
    /// Deterministic pattern scoring.
    Pattern(PatternTool),
    /// Vector similarity search.
    Similarity(SimilarityTool),
    /// LLM narrative reasoning with deterministic fallback.
    Reasoning(ReasoningTool),
    /// Deterministic recommendation builder.
    Recommendation(RecommendationTool),
    /// Rule draft assembly.
    RuleDraft(RuleDraftTool),
}

impl std::fmt::Debug for AgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTool").field("name", &self.name()).finish()
    }
}

impl AgentTool {
    /// Registered name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Context(_) => CONTEXT_TOOL,
            Self::Pattern(_) => PATTERN_TOOL,
            Self::Similarity(_) => SIMILARITY_TOOL,
            Self::Reasoning(_) => REASONING_TOOL,
            Self::Recommendation(_) => RECOMMENDATION_TOOL,
            Self::RuleDraft(_) => RULE_DRAFT_TOOL,
        }
    }

    /// One-line description for the planner catalog.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Context(_) => {
                "Fetch the transaction, card and merchant history, and window statistics"
            }
            Self::Pattern(_) => "Score deterministic fraud patterns over the gathered context",
            Self::Similarity(_) => "Find similar historical transactions via vector search",
            Self::Reasoning(_) => "Produce a narrative risk assessment of the evidence",
            Self::Recommendation(_) => "Derive prioritized analyst recommendations",
            Self::RuleDraft(_) => "Assemble a human-reviewable detection rule draft",
        }
    }

    /// Execute the tool against a state, returning a new state.
    ///
    /// # Errors
    ///
    /// Returns a [`ToolError`] when a collaborator fails; the executor
    /// records it and the planner adapts.
    pub async fn execute(
        &self,
        state: &InvestigationState,
    ) -> Result<InvestigationState, ToolError> {
        match self {
            Self::Context(tool) => tool.execute(state).await,
            Self::Pattern(tool) => tool.execute(state),
            Self::Similarity(tool) => tool.execute(state).await,
            Self::Reasoning(tool) => tool.execute(state).await,
            Self::Recommendation(tool) => tool.execute(state),
            Self::RuleDraft(tool) => tool.execute(state),
        }
    }
}

/// Registry mapping tool names to tool values, in fallback order.
#[derive(Debug)]
pub struct ToolRegistry {
    tools: Vec<AgentTool>,
}

impl ToolRegistry {
    /// Build a registry from tools; callers pass them in fallback order.
    pub fn new(tools: Vec<AgentTool>) -> Self {
        Self { tools }
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&AgentTool> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// The tool catalog for a mode. QUICK excludes similarity and rule
    /// draft.
    pub fn catalog(&self, mode: InvestigationMode) -> Vec<ToolSummary> {
        self.tools
            .iter()
            .filter(|t| match mode {
                InvestigationMode::Full => true,
                InvestigationMode::Quick => {
                    t.name() != SIMILARITY_TOOL && t.name() != RULE_DRAFT_TOOL
                }
            })
            .map(|t| ToolSummary {
                name: t.name(),
                description: t.description(),
            })
            .collect()
    }
}

/// Short description of what a tool was given, for the execution log.
pub fn input_summary(tool_name: &str, state: &InvestigationState) -> String {
    match tool_name {
        CONTEXT_TOOL => format!("transaction {}", state.transaction_id),
        PATTERN_TOOL | SIMILARITY_TOOL | REASONING_TOOL => format!(
            "transaction {} with {} evidence records",
            state.transaction_id,
            state.evidence.len()
        ),
        RECOMMENDATION_TOOL => format!(
            "severity {} confidence {:.2}",
            state.severity.as_str(),
            state.confidence_score
        ),
        RULE_DRAFT_TOOL => format!("{} recommendations", state.recommendations.len()),
        _ => format!("transaction {}", state.transaction_id),
    }
}

/// Short description of what a tool produced, for the execution log.
pub fn output_summary(tool_name: &str, state: &InvestigationState) -> String {
    match tool_name {
        CONTEXT_TOOL => match &state.context {
            Some(ctx) => format!(
                "context with {} card and {} merchant transactions",
                ctx.card_history.len(),
                ctx.merchant_history.len()
            ),
            None => "no context gathered".to_owned(),
        },
        PATTERN_TOOL => match &state.pattern_results {
            Some(p) => format!(
                "{} patterns detected, overall {:.2}",
                p.patterns_detected.len(),
                p.overall_score
            ),
            None => "no pattern results".to_owned(),
        },
        SIMILARITY_TOOL => match &state.similarity_results {
            Some(s) if s.skipped => "similarity search skipped (disabled)".to_owned(),
            Some(s) => format!(
                "{} matches, overall {:.2}",
                s.matches.len(),
                s.overall_score
            ),
            None => "no similarity results".to_owned(),
        },
        REASONING_TOOL => match &state.reasoning {
            Some(r) => format!(
                "risk {} via {} (confidence {:.2})",
                r.risk_level.as_str(),
                r.llm_status,
                r.confidence
            ),
            None => "no reasoning produced".to_owned(),
        },
        RECOMMENDATION_TOOL => format!("{} recommendations", state.recommendations.len()),
        RULE_DRAFT_TOOL => match &state.rule_draft {
            Some(d) => format!("rule draft '{}'", d.rule_name),
            None => "no rule draft warranted".to_owned(),
        },
        _ => String::new(),
    }
}
