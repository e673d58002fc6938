//! Rule draft tool: assemble a human-reviewable detection rule.
//!
//! Builds a normalized draft from the top-priority recommendation and its
//! supporting evidence. The draft is never exported by this tool — export
//! is a separate, explicitly human-gated action downstream.

use std::collections::BTreeMap;

use serde_json::json;

use crate::state::{
    EvidenceEnvelope, InvestigationState, Recommendation, RuleCondition, RuleDraftMetadata,
    RuleDraftPayload, Severity, TransactionContext,
};

use super::recommendation::{
    CARD_TESTING_REVIEW, CROSS_MERCHANT_REVIEW, STANDARD_REVIEW, VELOCITY_REVIEW,
};
use super::{insight_idempotency_key, ToolError, RULE_DRAFT_TOOL};

/// Assembles rule drafts from recommendations.
#[derive(Debug, Clone)]
pub struct RuleDraftTool {
    scoring: crate::config::ScoringSettings,
}

impl RuleDraftTool {
    /// Create the tool with the thresholds the draft conditions reference.
    pub fn new(scoring: crate::config::ScoringSettings) -> Self {
        Self { scoring }
    }

    /// Build a draft into a new state, or clear it when none is warranted.
    pub fn execute(&self, state: &InvestigationState) -> Result<InvestigationState, ToolError> {
        let mut next = state.clone();

        let Some(top) = state.recommendations.iter().min_by_key(|r| r.priority) else {
            next.rule_draft = None;
            return Ok(next);
        };

        // A routine low-severity review does not justify new fraud policy.
        if top.kind == STANDARD_REVIEW || state.severity < Severity::Medium {
            next.rule_draft = None;
            return Ok(next);
        }

        let Some(ctx) = &state.context else {
            next.rule_draft = None;
            return Ok(next);
        };

        let draft = self.build_draft(state, top, ctx);

        next.evidence.push(EvidenceEnvelope {
            category: "rule_draft".to_owned(),
            tool: RULE_DRAFT_TOOL.to_owned(),
            description: format!("draft '{}' from {}", draft.rule_name, top.kind),
            data: json!({
                "rule_name": draft.rule_name,
                "condition_count": draft.conditions.len(),
                "source_recommendation": top.id,
            }),
        });
        next.rule_draft = Some(draft);

        Ok(next)
    }

    fn build_draft(
        &self,
        state: &InvestigationState,
        top: &Recommendation,
        ctx: &TransactionContext,
    ) -> RuleDraftPayload {
        let mut conditions = Vec::new();
        let mut thresholds = BTreeMap::new();

        match top.kind.as_str() {
            VELOCITY_REVIEW => {
                conditions.push(condition(
                    "card_txn_count_1h",
                    ">=",
                    json!(self.scoring.velocity_1h_threshold),
                    "AND",
                ));
                conditions.push(condition(
                    "merchant_id",
                    "==",
                    json!(ctx.transaction.merchant_id),
                    "AND",
                ));
                thresholds.insert(
                    "velocity_1h".to_owned(),
                    f64::from(self.scoring.velocity_1h_threshold),
                );
            }
            CROSS_MERCHANT_REVIEW => {
                conditions.push(condition(
                    "card_unique_merchants_24h",
                    ">=",
                    json!(self.scoring.cross_merchant_threshold),
                    "AND",
                ));
                thresholds.insert(
                    "cross_merchant_24h".to_owned(),
                    f64::from(self.scoring.cross_merchant_threshold),
                );
            }
            CARD_TESTING_REVIEW => {
                conditions.push(condition(
                    "card_small_decline_run",
                    ">=",
                    json!(self.scoring.card_testing_run),
                    "AND",
                ));
                conditions.push(condition(
                    "amount",
                    "<=",
                    json!(self.scoring.card_testing_max_amount),
                    "AND",
                ));
                thresholds.insert(
                    "card_testing_run".to_owned(),
                    f64::from(self.scoring.card_testing_run),
                );
                thresholds.insert(
                    "small_amount_max".to_owned(),
                    self.scoring.card_testing_max_amount,
                );
            }
            _ => {
                conditions.push(condition(
                    "amount",
                    ">=",
                    json!(self.scoring.amount_elevated),
                    "AND",
                ));
                if let Some(mcc) = &ctx.transaction.mcc {
                    conditions.push(condition("mcc", "==", json!(mcc), "AND"));
                }
                thresholds.insert("amount_elevated".to_owned(), self.scoring.amount_elevated);
            }
        }

        RuleDraftPayload {
            rule_name: format!("ops_agent_{}_{}", top.kind, state.transaction_id),
            rule_description: format!(
                "Drafted from investigation {}: {} (severity {})",
                state.investigation_id,
                top.title,
                state.severity.as_str()
            ),
            conditions,
            thresholds,
            metadata: RuleDraftMetadata {
                recommendation_id: top.id,
                insight_key: insight_idempotency_key(&state.transaction_id, state.mode),
                source: "ops-agent".to_owned(),
            },
        }
    }
}

fn condition(field: &str, operator: &str, value: serde_json::Value, logical: &str) -> RuleCondition {
    RuleCondition {
        field_name: field.to_owned(),
        operator: operator.to_owned(),
        value,
        logical_op: logical.to_owned(),
    }
}
