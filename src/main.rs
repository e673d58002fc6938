#![allow(missing_docs)]

//! inquest CLI — operator entry points for the investigation runtime.
//!
//! One-shot subcommands for running and inspecting investigations
//! against the configured database and collaborators. The HTTP layer
//! lives elsewhere and calls the same service facade.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use inquest::agent::CompletionRepos;
use inquest::config::Settings;
use inquest::llm::{ChatModel, Embedder, HttpEmbedder, OpenAiChatModel};
use inquest::service::{AcknowledgeAction, InvestigationService, RunRequest};
use inquest::state::{InvestigationMode, Severity};
use inquest::store::{
    self, EmbeddingIndex, PgAuditRepo, PgEmbeddingIndex, PgInsightRepo, PgInvestigationRepo,
    PgRecommendationRepo, PgRuleDraftRepo, PgStateStore, PgToolLogRepo, RecommendationStatus,
    WorklistFilter,
};
use inquest::tm::{HttpTmClient, TmApi};

#[derive(Parser)]
#[command(name = "inquest", about = "Fraud operations analyst agent", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a new investigation for a transaction.
    Investigate {
        /// Transaction identifier to investigate.
        transaction_id: String,
        /// Use QUICK mode (deterministic planner, no similarity or rule draft).
        #[arg(long)]
        quick: bool,
        /// Case to reference in the audit trail.
        #[arg(long)]
        case_id: Option<String>,
        /// Include the rule draft in the output.
        #[arg(long)]
        rule_draft_preview: bool,
    },
    /// Resume an investigation from its latest snapshot.
    Resume {
        /// Investigation identifier.
        investigation_id: Uuid,
    },
    /// Show full detail for an investigation.
    Show {
        /// Investigation identifier.
        investigation_id: Uuid,
    },
    /// Show the rule draft for an investigation, if any.
    RuleDraft {
        /// Investigation identifier.
        investigation_id: Uuid,
    },
    /// List persisted insights for a transaction.
    Insights {
        /// Transaction identifier.
        transaction_id: String,
    },
    /// List the recommendation worklist.
    Worklist {
        /// Filter by status (OPEN, ACKNOWLEDGED, REJECTED, EXPORTED).
        #[arg(long)]
        status: Option<String>,
        /// Filter by severity (LOW, MEDIUM, HIGH, CRITICAL).
        #[arg(long)]
        severity: Option<String>,
        /// Filter by recommendation type.
        #[arg(long = "type")]
        rec_type: Option<String>,
        /// Keyset cursor from a previous page.
        #[arg(long)]
        cursor: Option<String>,
        /// Page size.
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Acknowledge or reject a recommendation.
    Acknowledge {
        /// Recommendation identifier.
        recommendation_id: Uuid,
        /// ACKNOWLEDGED or REJECTED.
        #[arg(long)]
        action: String,
        /// Optional analyst comment.
        #[arg(long)]
        comment: Option<String>,
        /// Acting analyst identifier.
        #[arg(long, default_value = "cli-operator")]
        performed_by: String,
    },
    /// Remove state snapshots past the retention window.
    Prune,
    /// Check database and TM health.
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    inquest::logging::init_cli();

    let cli = Cli::parse();
    let settings = Settings::load().context("failed to load settings")?;
    let service = build_service(settings).await?;

    match cli.command {
        Command::Investigate {
            transaction_id,
            quick,
            case_id,
            rule_draft_preview,
        } => {
            let envelope = service
                .run_investigation(RunRequest {
                    transaction_id,
                    mode: if quick {
                        InvestigationMode::Quick
                    } else {
                        InvestigationMode::Full
                    },
                    case_id,
                    include_rule_draft_preview: rule_draft_preview,
                })
                .await
                .map_err(print_service_error)?;
            print_json(&envelope)?;
        }
        Command::Resume { investigation_id } => {
            let envelope = service
                .resume(investigation_id)
                .await
                .map_err(print_service_error)?;
            print_json(&envelope)?;
        }
        Command::Show { investigation_id } => {
            let detail = service
                .get_investigation(investigation_id)
                .await
                .map_err(print_service_error)?;
            print_json(&detail)?;
        }
        Command::RuleDraft { investigation_id } => {
            let draft = service
                .rule_draft(investigation_id)
                .await
                .map_err(print_service_error)?;
            print_json(&draft)?;
        }
        Command::Insights { transaction_id } => {
            let insights = service
                .insights_for_transaction(&transaction_id)
                .await
                .map_err(print_service_error)?;
            let payload: Vec<serde_json::Value> = insights
                .into_iter()
                .map(|entry| {
                    serde_json::json!({
                        "insight": entry.insight,
                        "evidence": entry.evidence,
                    })
                })
                .collect();
            print_json(&payload)?;
        }
        Command::Worklist {
            status,
            severity,
            rec_type,
            cursor,
            limit,
        } => {
            let filter = WorklistFilter {
                status: match status.as_deref() {
                    Some(s) => Some(
                        RecommendationStatus::parse(s)
                            .with_context(|| format!("unknown status {s}"))?,
                    ),
                    None => None,
                },
                severity: match severity.as_deref() {
                    Some(s) => {
                        Some(Severity::parse(s).with_context(|| format!("unknown severity {s}"))?)
                    }
                    None => None,
                },
                kind: rec_type,
            };
            let page = service
                .worklist(filter, cursor, limit)
                .await
                .map_err(print_service_error)?;
            print_json(&serde_json::json!({
                "items": page.items,
                "next_cursor": page.next_cursor,
            }))?;
        }
        Command::Acknowledge {
            recommendation_id,
            action,
            comment,
            performed_by,
        } => {
            let action = AcknowledgeAction::parse(&action)
                .with_context(|| format!("action must be ACKNOWLEDGED or REJECTED, got {action}"))?;
            let record = service
                .acknowledge_recommendation(recommendation_id, action, comment, &performed_by)
                .await
                .map_err(print_service_error)?;
            print_json(&record)?;
        }
        Command::Prune => {
            let removed = service
                .prune_expired_state()
                .await
                .map_err(print_service_error)?;
            println!("removed {removed} expired state snapshots");
        }
        Command::Health => {
            let report = service.health().await;
            print_json(&report)?;
            if !report.database || !report.tm {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Wire Postgres repositories and HTTP collaborators into the service.
async fn build_service(settings: Settings) -> Result<InvestigationService> {
    let pool = store::connect(&settings.database)
        .await
        .context("failed to connect to database")?;
    store::apply_schema(&pool, settings.vector.dimension)
        .await
        .context("failed to apply schema")?;

    let repos = CompletionRepos {
        investigations: Arc::new(PgInvestigationRepo::new(pool.clone())),
        state_store: Arc::new(PgStateStore::new(pool.clone())),
        tool_log: Arc::new(PgToolLogRepo::new(pool.clone())),
        insights: Arc::new(PgInsightRepo::new(pool.clone())),
        recommendations: Arc::new(PgRecommendationRepo::new(pool.clone())),
        rule_drafts: Arc::new(PgRuleDraftRepo::new(pool.clone())),
        audit: Arc::new(PgAuditRepo::new(pool.clone())),
    };
    let embeddings: Arc<dyn EmbeddingIndex> = Arc::new(PgEmbeddingIndex::new(pool));

    let tm: Arc<dyn TmApi> = Arc::new(
        HttpTmClient::new(settings.tm.clone()).context("failed to build TM client")?,
    );

    let chat_model: Option<Arc<dyn ChatModel>> = if settings.planner.llm_enabled {
        Some(Arc::new(
            OpenAiChatModel::new(
                &settings.llm.base_url,
                &settings.llm.api_key,
                &settings.planner.model,
                Duration::from_secs(settings.agent.planner_timeout_seconds.max(
                    settings.agent.tool_timeout_seconds,
                )),
            )
            .context("failed to build LLM client")?,
        ))
    } else {
        None
    };

    let embedder: Option<Arc<dyn Embedder>> = if settings.vector.enabled {
        Some(Arc::new(
            HttpEmbedder::new(
                &settings.llm.base_url,
                &settings.llm.api_key,
                &settings.llm.embedding_model,
                usize::try_from(settings.vector.dimension).unwrap_or(1024),
                Duration::from_secs(settings.agent.tool_timeout_seconds),
            )
            .context("failed to build embedder")?,
        ))
    } else {
        None
    };

    Ok(InvestigationService::new(
        settings, repos, embeddings, tm, chat_model, embedder,
    ))
}

/// Print the canonical error envelope to stderr and convert for exit.
fn print_service_error(error: inquest::error::ServiceError) -> anyhow::Error {
    let envelope = error.envelope();
    eprintln!(
        "{}",
        serde_json::to_string_pretty(&envelope).unwrap_or_else(|_| envelope.to_string())
    );
    anyhow::anyhow!("{}", error.code())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
