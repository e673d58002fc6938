//! Similarity tool: vector search over historical transactions.
//!
//! When vector search is disabled this is the only tool allowed to mark
//! its result `skipped: true`. When enabled, failures propagate as tool
//! failures — there is no silent stub fallback.

use std::sync::Arc;

use serde_json::json;

use crate::config::VectorSettings;
use crate::llm::Embedder;
use crate::redaction::redact_card_id;
use crate::state::{
    EvidenceEnvelope, InvestigationState, SimilarityMatch, SimilarityResults, Transaction,
};
use crate::store::EmbeddingIndex;

use super::{ToolError, SIMILARITY_TOOL};

/// Vector similarity search over the embedding index.
pub struct SimilarityTool {
    embedder: Option<Arc<dyn Embedder>>,
    index: Arc<dyn EmbeddingIndex>,
    settings: VectorSettings,
}

impl SimilarityTool {
    /// Create the tool. The embedder may be `None` only when vector
    /// search is disabled.
    pub fn new(
        embedder: Option<Arc<dyn Embedder>>,
        index: Arc<dyn EmbeddingIndex>,
        settings: VectorSettings,
    ) -> Self {
        Self {
            embedder,
            index,
            settings,
        }
    }

    /// Search for similar transactions into a new state.
    pub async fn execute(
        &self,
        state: &InvestigationState,
    ) -> Result<InvestigationState, ToolError> {
        let mut next = state.clone();

        if !self.settings.enabled || !state.feature_flags.vector_enabled {
            next.similarity_results = Some(SimilarityResults {
                matches: vec![],
                overall_score: 0.0,
                skipped: true,
            });
            return Ok(next);
        }

        let Some(ctx) = &state.context else {
            return Ok(next);
        };
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| ToolError::Dependency("no embedder configured".to_owned()))?;

        let summary = canonical_summary(&ctx.transaction);
        let embedding = embedder.embed(&summary).await?;

        let hits = self
            .index
            .search(
                &embedding,
                self.settings.search_limit,
                self.settings.time_window_days,
                self.settings.min_similarity,
                &state.transaction_id,
            )
            .await?;

        let window_days = f64::from(self.settings.time_window_days.max(1));
        let mut matches: Vec<SimilarityMatch> = hits
            .into_iter()
            .map(|hit| {
                let weighted_score = hit.similarity * freshness(hit.age_days, window_days);
                SimilarityMatch {
                    transaction_id: hit.transaction_id,
                    similarity: hit.similarity,
                    age_days: hit.age_days,
                    weighted_score,
                }
            })
            .collect();
        matches.sort_by(|a, b| {
            b.weighted_score
                .partial_cmp(&a.weighted_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let overall_score = matches
            .first()
            .map(|m| m.weighted_score.clamp(0.0, 1.0))
            .unwrap_or(0.0);

        next.evidence.push(EvidenceEnvelope {
            category: "similarity_analysis".to_owned(),
            tool: SIMILARITY_TOOL.to_owned(),
            description: format!("{} similar transactions, overall {overall_score:.2}", matches.len()),
            data: json!({
                "match_count": matches.len(),
                "overall_score": overall_score,
                "min_similarity": self.settings.min_similarity,
            }),
        });
        next.similarity_results = Some(SimilarityResults {
            matches,
            overall_score,
            skipped: false,
        });

        Ok(next)
    }
}

/// Deterministic serialization of the transaction for embedding.
///
/// The card identifier is masked before it leaves the process.
pub fn canonical_summary(txn: &Transaction) -> String {
    use chrono::Timelike;
    format!(
        "transaction {} card {} merchant {} mcc {} amount {:.2} {} outcome {} hour {}",
        txn.transaction_id,
        redact_card_id(&txn.card_id),
        txn.merchant_id,
        txn.mcc.as_deref().unwrap_or("none"),
        txn.amount,
        txn.currency,
        txn.outcome,
        txn.occurred_at.hour(),
    )
}

/// Linear age decay: a fresh match keeps its similarity, one at the edge
/// of the window keeps half.
fn freshness(age_days: f64, window_days: f64) -> f64 {
    let ratio = (age_days / window_days).clamp(0.0, 1.0);
    1.0 - 0.5 * ratio
}
