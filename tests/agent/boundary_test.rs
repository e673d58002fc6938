//! Budget and safeguard boundary behaviors.

use std::sync::Arc;
use std::time::Duration;

use inquest::service::RunRequest;
use inquest::state::{InvestigationMode, InvestigationStatus};
use inquest::store::{StateStore, ToolLogRepo};

use super::common::{
    build_service, seed_velocity_burst, test_settings, ChatScript, ScriptedChat, TestRepos,
};

fn request(transaction_id: &str) -> RunRequest {
    RunRequest {
        transaction_id: transaction_id.to_owned(),
        mode: InvestigationMode::Full,
        case_id: None,
        include_rule_draft_preview: false,
    }
}

#[tokio::test]
async fn test_max_steps_one_runs_exactly_one_tool() {
    let (tm, target) = seed_velocity_burst(3);
    let repos = TestRepos::new();
    let mut settings = test_settings();
    settings.agent.max_steps = 1;

    let service = build_service(settings, &repos, Arc::new(tm), None, None);
    let envelope = service.run_investigation(request(&target)).await.expect("run");

    assert_eq!(envelope.status, InvestigationStatus::Completed);
    assert_eq!(envelope.step_count, 1);
    assert_eq!(envelope.tool_executions.len(), 1);
    assert_eq!(envelope.tool_executions[0].tool_name, "context_tool");

    // The final planner decision is a COMPLETE driven by the step budget.
    let last = envelope.planner_decisions.last().expect("decision");
    assert_eq!(last.selected_tool, "COMPLETE");
    assert!(last.reason.contains("step budget"));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_before_first_planner_call_times_out() {
    let (tm, target) = seed_velocity_burst(3);
    let repos = TestRepos::new();
    let mut settings = test_settings();
    settings.planner.llm_enabled = true;
    settings.agent.investigation_timeout_seconds = 1;
    settings.agent.planner_timeout_seconds = 30;

    // The first planner call stalls past the outer deadline.
    let service = build_service(
        settings,
        &repos,
        Arc::new(tm),
        Some(Arc::new(ScriptedChat {
            script: ChatScript::Stall(Duration::from_secs(10)),
        })),
        None,
    );

    let envelope = service.run_investigation(request(&target)).await.expect("run");

    assert_eq!(envelope.status, InvestigationStatus::TimedOut);
    let state = repos
        .state_store
        .load_state(envelope.investigation_id)
        .await
        .expect("load")
        .expect("state");
    assert_eq!(state.status, InvestigationStatus::TimedOut);
    assert!(state.completed_steps.is_empty());
    assert!(repos
        .tool_log
        .list(envelope.investigation_id)
        .await
        .expect("log")
        .is_empty());
}

#[tokio::test]
async fn test_vector_disabled_marks_skipped_and_does_not_loop() {
    let (tm, target) = seed_velocity_burst(12);
    let repos = TestRepos::new();
    let service = build_service(test_settings(), &repos, Arc::new(tm), None, None);

    let envelope = service.run_investigation(request(&target)).await.expect("run");
    let state = repos
        .state_store
        .load_state(envelope.investigation_id)
        .await
        .expect("load")
        .expect("state");

    let similarity = state.similarity_results.expect("similarity");
    assert!(similarity.skipped);

    // The tool ran exactly once and is never re-selected.
    let similarity_runs = envelope
        .tool_executions
        .iter()
        .filter(|t| t.tool_name == "similarity_tool")
        .count();
    assert_eq!(similarity_runs, 1);
    assert_eq!(
        state
            .completed_steps
            .iter()
            .filter(|t| t.as_str() == "similarity_tool")
            .count(),
        1
    );
}

#[tokio::test]
async fn test_no_duplicate_completed_steps_and_step_cap_respected() {
    let (tm, target) = seed_velocity_burst(12);
    let repos = TestRepos::new();
    let service = build_service(test_settings(), &repos, Arc::new(tm), None, None);

    let envelope = service.run_investigation(request(&target)).await.expect("run");
    let state = repos
        .state_store
        .load_state(envelope.investigation_id)
        .await
        .expect("load")
        .expect("state");

    let mut unique = state.completed_steps.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), state.completed_steps.len());
    assert!(state.step_count <= state.max_steps);

    // Versions strictly increased across the run: final version equals
    // the number of writes, and is at least one per node transition.
    let version = repos
        .state_store
        .version_of(envelope.investigation_id)
        .expect("version");
    assert!(version > i64::from(state.step_count));
}

#[tokio::test]
async fn test_terminal_audit_entry_written_once() {
    use inquest::store::AuditRepo;

    let (tm, target) = seed_velocity_burst(3);
    let repos = TestRepos::new();
    let service = build_service(test_settings(), &repos, Arc::new(tm), None, None);
    let envelope = service.run_investigation(request(&target)).await.expect("run");

    let entries = repos
        .audit
        .list_for_entity("investigation", &envelope.investigation_id.to_string())
        .await
        .expect("audit");
    let terminal: Vec<_> = entries
        .iter()
        .filter(|e| matches!(e.action.as_str(), "completed" | "failed" | "timed_out"))
        .collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].action, "completed");
}
