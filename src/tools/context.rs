//! Context tool: gather everything the rest of the pipeline scores.
//!
//! One TM overview call, then card and merchant history fetched
//! concurrently, then window statistics computed for 1 h / 6 h / 24 h /
//! 72 h windows anchored to the target transaction's timestamp — never to
//! wall clock, so re-running an old investigation yields the same numbers.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use serde_json::json;

use crate::config::TmSettings;
use crate::state::{
    EvidenceEnvelope, InvestigationState, Transaction, TransactionContext, WindowStats,
};
use crate::tm::TmApi;

use super::{ToolError, CONTEXT_TOOL};

/// Fetches transaction context from the TM collaborator.
pub struct ContextTool {
    tm: Arc<dyn TmApi>,
    settings: TmSettings,
}

impl ContextTool {
    /// Create the tool over a TM client.
    pub fn new(tm: Arc<dyn TmApi>, settings: TmSettings) -> Self {
        Self { tm, settings }
    }

    /// Gather context into a new state.
    pub async fn execute(
        &self,
        state: &InvestigationState,
    ) -> Result<InvestigationState, ToolError> {
        let mut next = state.clone();

        let overview = self.tm.overview(&state.transaction_id, true).await?;
        next.tm_usage.record("overview");
        let transaction = overview.transaction.clone();

        let (card_history, merchant_history) = tokio::join!(
            self.tm.card_history(
                &transaction.card_id,
                self.settings.history_hours,
                self.settings.history_max_pages,
            ),
            self.tm.merchant_history(
                &transaction.merchant_id,
                self.settings.history_hours,
                self.settings.history_max_pages,
            ),
        );
        let card_history = card_history?;
        next.tm_usage.record("card_history");
        let merchant_history = merchant_history?;
        next.tm_usage.record("merchant_history");

        let card_history = dedup_with_target(card_history, &transaction);

        let window_1h = window_stats(&transaction, &card_history, 1);
        let window_6h = window_stats(&transaction, &card_history, 6);
        let window_24h = window_stats(&transaction, &card_history, 24);
        let window_72h = window_stats(&transaction, &card_history, 72);

        next.evidence.push(EvidenceEnvelope {
            category: "transaction_context".to_owned(),
            tool: CONTEXT_TOOL.to_owned(),
            description: format!(
                "gathered {} card and {} merchant transactions over {}h",
                card_history.len(),
                merchant_history.len(),
                self.settings.history_hours
            ),
            data: json!({
                "card_history_count": card_history.len(),
                "merchant_history_count": merchant_history.len(),
                "matched_rule_count": overview.matched_rules.len(),
                "window_1h": window_1h,
                "window_24h": window_24h,
            }),
        });

        next.context = Some(TransactionContext {
            transaction,
            card_history,
            merchant_history,
            matched_rules: overview.matched_rules,
            review: overview.review,
            notes: overview.notes,
            case: overview.case,
            window_1h,
            window_6h,
            window_24h,
            window_72h,
        });

        Ok(next)
    }
}

/// Deduplicate history by transaction id, guaranteeing the target itself
/// is present so every window counts it.
fn dedup_with_target(history: Vec<Transaction>, target: &Transaction) -> Vec<Transaction> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut result = Vec::with_capacity(history.len().saturating_add(1));
    for txn in history {
        if seen.insert(txn.transaction_id.clone()) {
            result.push(txn);
        }
    }
    if seen.insert(target.transaction_id.clone()) {
        result.push(target.clone());
    }
    result.sort_by_key(|t| t.occurred_at);
    result
}

/// Statistics for the window `(target - hours, target]`, anchored to the
/// target transaction's timestamp.
pub fn window_stats(target: &Transaction, history: &[Transaction], hours: i64) -> WindowStats {
    let anchor = target.occurred_at;
    let cutoff = anchor - Duration::hours(hours);

    let mut stats = WindowStats::default();
    let mut merchants: HashSet<&str> = HashSet::new();

    for txn in history {
        if txn.occurred_at <= cutoff || txn.occurred_at > anchor {
            continue;
        }
        stats.transaction_count = stats.transaction_count.saturating_add(1);
        stats.total_amount += txn.amount;
        merchants.insert(txn.merchant_id.as_str());
        if txn.is_declined() {
            stats.decline_count = stats.decline_count.saturating_add(1);
        }
    }

    stats.unique_merchants = u32::try_from(merchants.len()).unwrap_or(u32::MAX);
    stats
}
