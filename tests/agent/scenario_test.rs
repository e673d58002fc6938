//! End-to-end scenarios over canned collaborators.

use std::sync::Arc;

use inquest::error::ServiceError;
use inquest::service::RunRequest;
use inquest::state::{InvestigationMode, InvestigationStatus, Severity};
use inquest::store::{InvestigationRepo, RuleDraftRepo, StateStore};
use inquest::tm::TmApi;

use super::common::{
    build_service, seed_velocity_burst, seeded_txn, test_settings, CannedTm, ChatScript,
    ScriptedChat, TestRepos,
};

fn full_request(transaction_id: &str) -> RunRequest {
    RunRequest {
        transaction_id: transaction_id.to_owned(),
        mode: InvestigationMode::Full,
        case_id: None,
        include_rule_draft_preview: true,
    }
}

#[tokio::test]
async fn test_velocity_burst_end_to_end() {
    let (tm, target) = seed_velocity_burst(12);
    let repos = TestRepos::new();
    let service = build_service(test_settings(), &repos, Arc::new(tm), None, None);

    let envelope = service
        .run_investigation(full_request(&target))
        .await
        .expect("run");

    assert_eq!(envelope.status, InvestigationStatus::Completed);
    assert!(envelope.severity >= Severity::Medium);

    let state = repos
        .state_store
        .load_state(envelope.investigation_id)
        .await
        .expect("load")
        .expect("state");
    let patterns = state.pattern_results.expect("patterns");
    assert!(patterns.patterns_detected.iter().any(|p| p == "velocity"));
    assert_eq!(
        state.context.expect("context").window_1h.transaction_count,
        12
    );

    assert!(!envelope.recommendations.is_empty());
    assert!(envelope
        .recommendations
        .iter()
        .any(|r| r.kind == "velocity_review"));

    // LLM disabled: no model calls at all.
    assert_eq!(envelope.agentic_trace.llm_usage.planner_calls, 0);
    assert_eq!(envelope.agentic_trace.llm_usage.reasoning_calls, 0);
}

#[tokio::test]
async fn test_cross_merchant_spread_end_to_end() {
    let mut transactions = Vec::new();
    for i in 0..11i64 {
        transactions.push(seeded_txn(
            &format!("txn_spread_{i}"),
            "tok_spread_Y",
            &format!("m_{i}"),
            10i64.saturating_sub(i).saturating_mul(120),
            30.0,
            "approved",
        ));
    }
    let tm = CannedTm::new(transactions);
    let repos = TestRepos::new();
    let service = build_service(test_settings(), &repos, Arc::new(tm), None, None);

    let envelope = service
        .run_investigation(full_request("txn_spread_10"))
        .await
        .expect("run");

    assert!(envelope.severity >= Severity::Medium);
    let state = repos
        .state_store
        .load_state(envelope.investigation_id)
        .await
        .expect("load")
        .expect("state");
    let patterns = state.pattern_results.expect("patterns");
    assert!(patterns
        .patterns_detected
        .iter()
        .any(|p| p == "cross_merchant"));
    assert_eq!(
        state.context.expect("context").window_24h.unique_merchants,
        11
    );
}

#[tokio::test]
async fn test_legitimate_counter_evidence() {
    let mut transactions = vec![{
        let mut t = seeded_txn("txn_legit", "tok_regular", "m_grocer", 0, 50.0, "approved");
        t.three_ds_verified = true;
        t.device_trusted = true;
        t
    }];
    for i in 1..=5i64 {
        transactions.push(seeded_txn(
            &format!("txn_prior_{i}"),
            "tok_regular",
            "m_grocer",
            i.saturating_mul(600),
            48.0,
            "approved",
        ));
    }
    let tm = CannedTm::new(transactions);
    let repos = TestRepos::new();
    let service = build_service(test_settings(), &repos, Arc::new(tm), None, None);

    let envelope = service
        .run_investigation(full_request("txn_legit"))
        .await
        .expect("run");

    assert_eq!(envelope.severity, Severity::Low);
    assert_eq!(envelope.recommendations.len(), 1);
    assert_eq!(envelope.recommendations[0].kind, "standard_review");
    assert!(envelope.rule_draft.is_none());
    assert!(repos
        .rule_drafts
        .get_for_investigation(envelope.investigation_id)
        .await
        .expect("draft lookup")
        .is_none());
}

#[tokio::test]
async fn test_llm_outage_with_hybrid_configuration() {
    let (tm, target) = seed_velocity_burst(12);
    let repos = TestRepos::new();
    let mut settings = test_settings();
    settings.planner.llm_enabled = true;

    let service = build_service(
        settings,
        &repos,
        Arc::new(tm),
        Some(Arc::new(ScriptedChat {
            script: ChatScript::Outage,
        })),
        None,
    );

    let envelope = service
        .run_investigation(full_request(&target))
        .await
        .expect("run");

    assert_eq!(envelope.status, InvestigationStatus::Completed);
    assert!(envelope.agentic_trace.llm_usage.fallback_count >= 2);
    assert!(envelope
        .planner_decisions
        .iter()
        .filter(|d| d.selected_tool != "COMPLETE")
        .all(|d| d.used_fallback));

    let state = repos
        .state_store
        .load_state(envelope.investigation_id)
        .await
        .expect("load")
        .expect("state");
    assert_eq!(state.reasoning.expect("reasoning").llm_status, "fallback");
    assert!(envelope.severity >= Severity::Medium);
}

#[tokio::test]
async fn test_duplicate_request_conflicts() {
    let (tm, target) = seed_velocity_burst(3);
    let tm: Arc<dyn TmApi> = Arc::new(tm);
    let repos = TestRepos::new();
    let service = build_service(test_settings(), &repos, tm, None, None);

    // Simulate the first request still being in flight.
    let first = service
        .run_investigation(full_request(&target))
        .await
        .expect("first run");
    repos
        .investigations
        .set_status(first.investigation_id, InvestigationStatus::InProgress)
        .await
        .expect("flip back");

    let second = service.run_investigation(full_request(&target)).await;
    match second {
        Err(ServiceError::Conflict {
            existing_investigation_id,
            ..
        }) => {
            assert_eq!(existing_investigation_id, Some(first.investigation_id));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    let err = service
        .run_investigation(full_request(&target))
        .await
        .expect_err("still conflicting");
    assert_eq!(err.code(), "OPS_AGENT_CONFLICT");
    assert_eq!(err.http_status(), 409);
}

#[tokio::test]
async fn test_rerun_is_idempotent_on_insights() {
    let (tm, target) = seed_velocity_burst(12);
    let repos = TestRepos::new();
    let service = build_service(test_settings(), &repos, Arc::new(tm), None, None);

    let first = service
        .run_investigation(full_request(&target))
        .await
        .expect("first run");
    let second = service
        .run_investigation(full_request(&target))
        .await
        .expect("second run");
    assert_ne!(first.investigation_id, second.investigation_id);

    let insights = service
        .insights_for_transaction(&target)
        .await
        .expect("insights");
    assert_eq!(insights.len(), 1, "idempotency key must dedupe insights");
    assert_eq!(
        insights[0].insight.investigation_id,
        second.investigation_id
    );
    // Evidence replaced, not accumulated across runs.
    let categories: Vec<&str> = insights[0]
        .evidence
        .iter()
        .map(|e| e.category.as_str())
        .collect();
    let pattern_count = categories
        .iter()
        .filter(|c| **c == "pattern_analysis")
        .count();
    assert_eq!(pattern_count, 1);
}

#[tokio::test]
async fn test_quick_mode_skips_similarity_and_rule_draft() {
    let (tm, target) = seed_velocity_burst(12);
    let repos = TestRepos::new();
    let service = build_service(test_settings(), &repos, Arc::new(tm), None, None);

    let envelope = service
        .run_investigation(RunRequest {
            transaction_id: target,
            mode: InvestigationMode::Quick,
            case_id: None,
            include_rule_draft_preview: true,
        })
        .await
        .expect("run");

    assert_eq!(envelope.status, InvestigationStatus::Completed);
    let executed: Vec<&str> = envelope
        .tool_executions
        .iter()
        .map(|t| t.tool_name.as_str())
        .collect();
    assert!(!executed.contains(&"similarity_tool"));
    assert!(!executed.contains(&"rule_draft_tool"));
    assert!(executed.contains(&"context_tool"));
    assert!(executed.contains(&"recommendation_tool"));
    assert!(envelope.rule_draft.is_none());
}

#[tokio::test]
async fn test_similarity_links_previously_indexed_run() {
    use super::common::FixedEmbedder;

    // A burst today plus one transaction on the same card a day earlier.
    let mut all = vec![seeded_txn(
        "txn_burst_prev",
        "tok_burst_X",
        "m_electronics",
        1_440,
        25.0,
        "approved",
    )];
    for i in 0..12i64 {
        all.push(seeded_txn(
            &format!("txn_burst_{i}"),
            "tok_burst_X",
            "m_electronics",
            11i64.saturating_sub(i).saturating_mul(5),
            25.0,
            "approved",
        ));
    }
    let transactions = CannedTm::new(all);

    let repos = TestRepos::new();
    let mut settings = test_settings();
    settings.vector.enabled = true;
    let embedder = Arc::new(FixedEmbedder {
        vector: vec![1.0, 0.0, 0.0],
    });
    let service = build_service(
        settings,
        &repos,
        Arc::new(transactions),
        None,
        Some(embedder),
    );

    // First run indexes its transaction for future searches.
    let first = service
        .run_investigation(full_request("txn_burst_prev"))
        .await
        .expect("first run");
    assert_eq!(first.status, InvestigationStatus::Completed);

    // Second run finds the first as a neighbor.
    let second = service
        .run_investigation(full_request("txn_burst_11"))
        .await
        .expect("second run");
    let state = repos
        .state_store
        .load_state(second.investigation_id)
        .await
        .expect("load")
        .expect("state");
    let similarity = state.similarity_results.expect("similarity");
    assert!(!similarity.skipped);
    assert!(similarity
        .matches
        .iter()
        .any(|m| m.transaction_id == "txn_burst_prev"));
    assert!(similarity.overall_score > 0.9);
}

#[tokio::test]
async fn test_llm_driven_early_completion() {
    let (tm, target) = seed_velocity_burst(3);
    let repos = TestRepos::new();
    let mut settings = test_settings();
    settings.planner.llm_enabled = true;

    let service = build_service(
        settings,
        &repos,
        Arc::new(tm),
        Some(Arc::new(ScriptedChat {
            script: ChatScript::Reply(
                r#"{"tool":"COMPLETE","reason":"nothing to do","confidence":0.9}"#.to_owned(),
            ),
        })),
        None,
    );

    let envelope = service
        .run_investigation(full_request(&target))
        .await
        .expect("run");

    assert_eq!(envelope.status, InvestigationStatus::Completed);
    assert_eq!(envelope.step_count, 0);
    assert!(envelope.tool_executions.is_empty());
    assert_eq!(envelope.agentic_trace.llm_usage.planner_calls, 1);
    assert!(!envelope.planner_decisions[0].used_fallback);
    // Nothing was gathered, and the trace says so.
    assert!(envelope
        .agentic_trace
        .evidence_gaps
        .contains(&"context".to_owned()));
}

#[tokio::test]
async fn test_invalid_transaction_id_rejected() {
    let repos = TestRepos::new();
    let service = build_service(
        test_settings(),
        &repos,
        Arc::new(CannedTm::default()),
        None,
        None,
    );
    let err = service
        .run_investigation(full_request("   "))
        .await
        .expect_err("must reject");
    assert_eq!(err.code(), "OPS_AGENT_INVALID_REQUEST");
}

#[tokio::test]
async fn test_unknown_transaction_fails_investigation() {
    // TM has nothing: context_tool fails, the planner terminates, and the
    // run persists as FAILED.
    let repos = TestRepos::new();
    let service = build_service(
        test_settings(),
        &repos,
        Arc::new(CannedTm::default()),
        None,
        None,
    );
    let envelope = service
        .run_investigation(full_request("txn_ghost"))
        .await
        .expect("run completes with failed status");
    assert_eq!(envelope.status, InvestigationStatus::Failed);
    let row = repos
        .investigations
        .get(envelope.investigation_id)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(row.status, InvestigationStatus::Failed);
    // The single context attempt is on record.
    assert_eq!(envelope.tool_executions.len(), 1);
    assert_eq!(envelope.tool_executions[0].tool_name, "context_tool");
}
