//! Shared canned collaborators and wiring for runtime integration tests.
//!
//! External variability is pinned: TM serves seeded transactions, the
//! chat model is scripted, the embedder returns fixed vectors, and all
//! repositories are the in-memory implementations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use inquest::agent::CompletionRepos;
use inquest::config::Settings;
use inquest::llm::{ChatModel, ChatRequest, ChatResponse, Embedder, EmbedderError, LlmError};
use inquest::service::InvestigationService;
use inquest::state::Transaction;
use inquest::store::memory::{
    MemoryAuditRepo, MemoryEmbeddingIndex, MemoryInsightRepo, MemoryInvestigationRepo,
    MemoryRecommendationRepo, MemoryRuleDraftRepo, MemoryStateStore, MemoryToolLogRepo,
};
use inquest::store::EmbeddingIndex;
use inquest::tm::{TmApi, TmError, TmOverview};

/// Anchor timestamp all seeded transactions are relative to.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).single().expect("timestamp")
}

/// Build a seeded transaction.
pub fn seeded_txn(
    id: &str,
    card: &str,
    merchant: &str,
    minutes_before: i64,
    amount: f64,
    outcome: &str,
) -> Transaction {
    Transaction {
        transaction_id: id.to_owned(),
        card_id: card.to_owned(),
        merchant_id: merchant.to_owned(),
        merchant_name: None,
        mcc: Some("5999".to_owned()),
        amount,
        currency: "USD".to_owned(),
        outcome: outcome.to_owned(),
        three_ds_verified: false,
        device_trusted: false,
        occurred_at: base_time() - chrono::Duration::minutes(minutes_before),
    }
}

/// Canned TM collaborator serving seeded transactions.
#[derive(Default)]
pub struct CannedTm {
    transactions: HashMap<String, Transaction>,
}

impl CannedTm {
    pub fn new(transactions: Vec<Transaction>) -> Self {
        Self {
            transactions: transactions
                .into_iter()
                .map(|t| (t.transaction_id.clone(), t))
                .collect(),
        }
    }
}

#[async_trait]
impl TmApi for CannedTm {
    async fn overview(
        &self,
        transaction_id: &str,
        _include_rules: bool,
    ) -> Result<TmOverview, TmError> {
        let transaction = self
            .transactions
            .get(transaction_id)
            .cloned()
            .ok_or_else(|| TmError::HttpStatus {
                status: 404,
                body: format!("transaction {transaction_id} not found"),
            })?;
        Ok(TmOverview {
            transaction,
            review: None,
            notes: vec![],
            case: None,
            matched_rules: vec![],
        })
    }

    async fn card_history(
        &self,
        card_id: &str,
        _hours_back: u32,
        _max_pages: u32,
    ) -> Result<Vec<Transaction>, TmError> {
        Ok(self
            .transactions
            .values()
            .filter(|t| t.card_id == card_id)
            .cloned()
            .collect())
    }

    async fn merchant_history(
        &self,
        merchant_id: &str,
        _hours_back: u32,
        _max_pages: u32,
    ) -> Result<Vec<Transaction>, TmError> {
        Ok(self
            .transactions
            .values()
            .filter(|t| t.merchant_id == merchant_id)
            .cloned()
            .collect())
    }

    async fn health(&self) -> bool {
        true
    }
}

/// Scripted chat model behaviors.
pub enum ChatScript {
    /// Every call fails.
    Outage,
    /// Every call returns this content.
    Reply(String),
    /// Every call sleeps this long before failing.
    Stall(Duration),
}

/// A chat model driven by a fixed script.
pub struct ScriptedChat {
    pub script: ChatScript,
}

#[async_trait]
impl ChatModel for ScriptedChat {
    async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        match &self.script {
            ChatScript::Outage => Err(LlmError::Unavailable("scripted outage".to_owned())),
            ChatScript::Reply(content) => Ok(ChatResponse {
                content: content.clone(),
                prompt_tokens: 100,
                completion_tokens: 30,
                model: "scripted".to_owned(),
            }),
            ChatScript::Stall(duration) => {
                tokio::time::sleep(*duration).await;
                Err(LlmError::Timeout)
            }
        }
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}

/// Embedder returning one fixed vector for every input.
pub struct FixedEmbedder {
    pub vector: Vec<f32>,
}

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedderError> {
        Ok(self.vector.clone())
    }

    fn dimensions(&self) -> usize {
        self.vector.len()
    }
}

/// Handles to the in-memory repositories backing a test service.
pub struct TestRepos {
    pub investigations: Arc<MemoryInvestigationRepo>,
    pub state_store: Arc<MemoryStateStore>,
    pub tool_log: Arc<MemoryToolLogRepo>,
    pub insights: Arc<MemoryInsightRepo>,
    pub recommendations: Arc<MemoryRecommendationRepo>,
    pub rule_drafts: Arc<MemoryRuleDraftRepo>,
    pub audit: Arc<MemoryAuditRepo>,
    pub embeddings: Arc<MemoryEmbeddingIndex>,
}

impl TestRepos {
    pub fn new() -> Self {
        Self {
            investigations: Arc::new(MemoryInvestigationRepo::default()),
            state_store: Arc::new(MemoryStateStore::default()),
            tool_log: Arc::new(MemoryToolLogRepo::default()),
            insights: Arc::new(MemoryInsightRepo::default()),
            recommendations: Arc::new(MemoryRecommendationRepo::default()),
            rule_drafts: Arc::new(MemoryRuleDraftRepo::default()),
            audit: Arc::new(MemoryAuditRepo::default()),
            embeddings: Arc::new(MemoryEmbeddingIndex::default()),
        }
    }

    pub fn completion_repos(&self) -> CompletionRepos {
        CompletionRepos {
            investigations: self.investigations.clone(),
            state_store: self.state_store.clone(),
            tool_log: self.tool_log.clone(),
            insights: self.insights.clone(),
            recommendations: self.recommendations.clone(),
            rule_drafts: self.rule_drafts.clone(),
            audit: self.audit.clone(),
        }
    }
}

/// Settings tuned for deterministic in-memory runs: LLM and vector
/// search off unless a test switches them on.
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.environment = "local".to_owned();
    settings.planner.llm_enabled = false;
    settings.vector.enabled = false;
    settings
}

/// Wire a service over in-memory repositories and canned collaborators.
pub fn build_service(
    settings: Settings,
    repos: &TestRepos,
    tm: Arc<dyn TmApi>,
    chat: Option<Arc<dyn ChatModel>>,
    embedder: Option<Arc<dyn Embedder>>,
) -> InvestigationService {
    let embeddings: Arc<dyn EmbeddingIndex> = repos.embeddings.clone();
    InvestigationService::new(
        settings,
        repos.completion_repos(),
        embeddings,
        tm,
        chat,
        embedder,
    )
}

/// Seed scenario: a velocity burst of `count` transactions on one card
/// at one merchant, five minutes apart, target last.
pub fn seed_velocity_burst(count: i64) -> (CannedTm, String) {
    let mut transactions = Vec::new();
    for i in 0..count {
        transactions.push(seeded_txn(
            &format!("txn_burst_{i}"),
            "tok_burst_X",
            "m_electronics",
            count.saturating_sub(1).saturating_sub(i).saturating_mul(5),
            25.0,
            "approved",
        ));
    }
    let target = format!("txn_burst_{}", count - 1);
    (CannedTm::new(transactions), target)
}
