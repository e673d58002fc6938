//! Recommendation tool: deterministic analyst actions from the evidence.
//!
//! Pure computation over everything gathered so far. Candidates are
//! sorted severity-descending, then rule id ascending, then by type name
//! for stability; priorities are assigned from the sorted order (1 is
//! highest). Every payload carries enough context to act without
//! re-querying.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::state::{
    EvidenceEnvelope, InvestigationState, Recommendation, Severity, TransactionContext,
};

use super::{ToolError, RECOMMENDATION_TOOL};

/// Recommendation type emitted when nothing else fires.
pub const STANDARD_REVIEW: &str = "standard_review";
/// Recommendation type for velocity bursts.
pub const VELOCITY_REVIEW: &str = "velocity_review";
/// Recommendation type for cross-merchant spread.
pub const CROSS_MERCHANT_REVIEW: &str = "cross_merchant_review";
/// Recommendation type for card-testing runs.
pub const CARD_TESTING_REVIEW: &str = "card_testing_review";
/// Recommendation type for blocking a card.
pub const BLOCK_CARD: &str = "block_card";
/// Recommendation type for tightening an existing rule.
pub const RULE_TIGHTENING: &str = "rule_tightening";
/// Recommendation type for reviewing linked historical fraud.
pub const LINKED_FRAUD_REVIEW: &str = "linked_fraud_review";

struct Candidate {
    kind: &'static str,
    severity: Severity,
    rule_id: String,
    title: String,
    impact: String,
    payload: Value,
}

/// Deterministic recommendation builder.
#[derive(Debug, Clone, Default)]
pub struct RecommendationTool;

impl RecommendationTool {
    /// Create the tool.
    pub fn new() -> Self {
        Self
    }

    /// Build recommendations into a new state.
    pub fn execute(&self, state: &InvestigationState) -> Result<InvestigationState, ToolError> {
        let mut next = state.clone();
        let Some(ctx) = &state.context else {
            return Ok(next);
        };

        let mut candidates = build_candidates(state, ctx);

        // Severity descending, rule id ascending, then type for stability.
        candidates.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
                .then_with(|| a.kind.cmp(b.kind))
        });

        let recommendations: Vec<Recommendation> = candidates
            .into_iter()
            .enumerate()
            .map(|(index, c)| Recommendation {
                id: Uuid::new_v4(),
                kind: c.kind.to_owned(),
                priority: u32::try_from(index).unwrap_or(u32::MAX).saturating_add(1),
                title: c.title,
                impact: c.impact,
                payload: c.payload,
            })
            .collect();

        next.evidence.push(EvidenceEnvelope {
            category: "recommendations".to_owned(),
            tool: RECOMMENDATION_TOOL.to_owned(),
            description: format!("{} recommendations", recommendations.len()),
            data: json!({
                "count": recommendations.len(),
                "types": recommendations.iter().map(|r| r.kind.clone()).collect::<Vec<_>>(),
            }),
        });
        next.recommendations = recommendations;

        Ok(next)
    }
}

fn base_payload(state: &InvestigationState, ctx: &TransactionContext) -> Value {
    json!({
        "transaction_id": state.transaction_id,
        "amount": ctx.transaction.amount,
        "currency": ctx.transaction.currency,
        "merchant_id": ctx.transaction.merchant_id,
        "mcc": ctx.transaction.mcc,
        "window_24h": ctx.window_24h,
    })
}

fn with_extra(mut payload: Value, key: &str, value: Value) -> Value {
    if let Some(obj) = payload.as_object_mut() {
        obj.insert(key.to_owned(), value);
    }
    payload
}

fn detected(state: &InvestigationState, pattern: &str) -> bool {
    state
        .pattern_results
        .as_ref()
        .map(|p| p.patterns_detected.iter().any(|d| d == pattern))
        .unwrap_or(false)
}

fn build_candidates(state: &InvestigationState, ctx: &TransactionContext) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let base = base_payload(state, ctx);

    if state.severity >= Severity::High {
        candidates.push(Candidate {
            kind: BLOCK_CARD,
            severity: state.severity,
            rule_id: String::new(),
            title: "Block card pending investigation".to_owned(),
            impact: "Stops further exposure on a card showing strong fraud signals".to_owned(),
            payload: with_extra(
                base.clone(),
                "card_id",
                json!(crate::redaction::redact_card_id(&ctx.transaction.card_id)),
            ),
        });
    }

    if detected(state, super::pattern::VELOCITY) {
        candidates.push(Candidate {
            kind: VELOCITY_REVIEW,
            severity: state.severity.max(Severity::Medium),
            rule_id: String::new(),
            title: "Review velocity burst on card".to_owned(),
            impact: "Confirms or clears a burst of rapid transactions".to_owned(),
            payload: with_extra(
                base.clone(),
                "window_1h",
                serde_json::to_value(ctx.window_1h).unwrap_or(Value::Null),
            ),
        });
    }

    if detected(state, super::pattern::CROSS_MERCHANT) {
        candidates.push(Candidate {
            kind: CROSS_MERCHANT_REVIEW,
            severity: state.severity.max(Severity::Medium),
            rule_id: String::new(),
            title: "Review cross-merchant spread".to_owned(),
            impact: "Flags a card used across unusually many merchants".to_owned(),
            payload: base.clone(),
        });
    }

    if detected(state, super::pattern::CARD_TESTING) {
        candidates.push(Candidate {
            kind: CARD_TESTING_REVIEW,
            severity: Severity::High,
            rule_id: String::new(),
            title: "Review card-testing decline run".to_owned(),
            impact: "Catches enumeration of a stolen card via small declines".to_owned(),
            payload: with_extra(
                base.clone(),
                "decline_count_72h",
                json!(ctx.window_72h.decline_count),
            ),
        });
    }

    let pattern_overall = state
        .pattern_results
        .as_ref()
        .map(|p| p.overall_score)
        .unwrap_or(0.0);
    if !ctx.matched_rules.is_empty() && pattern_overall >= 0.3 {
        // Lowest rule id first so the tie-break is deterministic.
        let mut rule_ids: Vec<String> = ctx
            .matched_rules
            .iter()
            .filter_map(|r| r.get("rule_id").and_then(Value::as_str))
            .map(str::to_owned)
            .collect();
        rule_ids.sort();
        if let Some(rule_id) = rule_ids.into_iter().next() {
            candidates.push(Candidate {
                kind: RULE_TIGHTENING,
                severity: Severity::Medium,
                rule_id: rule_id.clone(),
                title: format!("Tighten rule {rule_id}"),
                impact: "The matched rule fired but did not stop the transaction".to_owned(),
                payload: with_extra(base.clone(), "rule_id", json!(rule_id)),
            });
        }
    }

    let similarity_overall = state
        .similarity_results
        .as_ref()
        .filter(|s| !s.skipped)
        .map(|s| s.overall_score)
        .unwrap_or(0.0);
    if similarity_overall >= 0.5 {
        let linked: Vec<String> = state
            .similarity_results
            .as_ref()
            .map(|s| {
                s.matches
                    .iter()
                    .take(5)
                    .map(|m| m.transaction_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        candidates.push(Candidate {
            kind: LINKED_FRAUD_REVIEW,
            severity: Severity::Medium,
            rule_id: String::new(),
            title: "Review similar historical transactions".to_owned(),
            impact: "Links this transaction to prior confirmed patterns".to_owned(),
            payload: with_extra(base.clone(), "linked_transactions", json!(linked)),
        });
    }

    if candidates.is_empty() {
        candidates.push(Candidate {
            kind: STANDARD_REVIEW,
            severity: Severity::Low,
            rule_id: String::new(),
            title: "Standard review".to_owned(),
            impact: "No strong fraud signal; routine confirmation only".to_owned(),
            payload: base,
        });
    }

    candidates
}
