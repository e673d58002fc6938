//! Resume semantics: continue from the latest snapshot.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use inquest::state::{
    InvestigationState, InvestigationStatus, ToolExecution, ToolStatus,
};
use inquest::store::{Investigation, InvestigationRepo, StateStore, ToolLogRepo};
use inquest::tm::TmApi;
use inquest::tools::{ContextTool, PatternTool};

use super::common::{build_service, seed_velocity_burst, test_settings, TestRepos};

fn fabricated_execution(tool_name: &str, step_number: u32) -> ToolExecution {
    ToolExecution {
        tool_name: tool_name.to_owned(),
        step_number,
        status: ToolStatus::Success,
        input_summary: format!("transaction txn for {tool_name}"),
        output_summary: "ok".to_owned(),
        execution_time_ms: 5,
        error_message: None,
        timestamp: Utc::now(),
    }
}

/// Build the state of a run that was killed right after pattern_tool,
/// by actually executing the first two tools.
async fn interrupted_state(
    settings: &inquest::config::Settings,
    tm: Arc<dyn TmApi>,
    transaction_id: &str,
) -> InvestigationState {
    let mut state = InvestigationState::new(
        Uuid::new_v4(),
        transaction_id.to_owned(),
        inquest::state::InvestigationMode::Full,
        settings.feature_flags(),
        settings.safeguards(),
        settings.planner.model.clone(),
        Utc::now(),
    );
    state.status = InvestigationStatus::InProgress;

    let context_tool = ContextTool::new(tm, settings.tm.clone());
    state = context_tool.execute(&state).await.expect("context");
    state.mark_completed("context_tool");
    state.step_count = 1;
    state.tool_executions.push(fabricated_execution("context_tool", 1));

    let pattern_tool = PatternTool::new(settings.scoring.clone());
    state = pattern_tool.execute(&state).expect("pattern");
    state.mark_completed("pattern_tool");
    state.step_count = 2;
    state.tool_executions.push(fabricated_execution("pattern_tool", 2));

    state
}

#[tokio::test]
async fn test_resume_continues_where_it_stopped() {
    let (tm, target) = seed_velocity_burst(12);
    let tm: Arc<dyn TmApi> = Arc::new(tm);
    let repos = TestRepos::new();
    let settings = test_settings();
    let service = build_service(settings.clone(), &repos, tm.clone(), None, None);

    let state = interrupted_state(&settings, tm, &target).await;
    let investigation_id = state.investigation_id;
    assert_eq!(
        state.completed_steps,
        vec!["context_tool".to_owned(), "pattern_tool".to_owned()],
        "resume entry point has the first two tools done"
    );

    repos
        .investigations
        .create(&Investigation {
            id: investigation_id,
            transaction_id: target.clone(),
            mode: inquest::state::InvestigationMode::Full,
            status: InvestigationStatus::InProgress,
            severity: None,
            final_confidence: None,
            step_count: 2,
            max_steps: state.max_steps,
            planner_model: settings.planner.model.clone(),
            started_at: state.started_at,
            completed_at: None,
        })
        .await
        .expect("row");
    repos
        .state_store
        .save_state(investigation_id, &state)
        .await
        .expect("snapshot");

    let envelope = service.resume(investigation_id).await.expect("resume");

    assert_eq!(envelope.investigation_id, investigation_id);
    assert_eq!(envelope.status, InvestigationStatus::Completed);

    let final_state = repos
        .state_store
        .load_state(investigation_id)
        .await
        .expect("load")
        .expect("state");
    let mut completed = final_state.completed_steps.clone();
    completed.sort();
    assert_eq!(
        completed,
        vec![
            "context_tool",
            "pattern_tool",
            "recommendation_tool",
            "reasoning_tool",
            "rule_draft_tool",
            "similarity_tool",
        ]
    );

    // Context and pattern were not re-executed.
    let context_runs = final_state
        .tool_executions
        .iter()
        .filter(|t| t.tool_name == "context_tool")
        .count();
    assert_eq!(context_runs, 1);

    // Tool log has distinct, gap-free step numbers.
    let log = repos
        .tool_log
        .list(investigation_id)
        .await
        .expect("tool log");
    let steps: Vec<u32> = log.iter().map(|e| e.step_number).collect();
    let unique: HashSet<u32> = steps.iter().copied().collect();
    assert_eq!(unique.len(), steps.len(), "no duplicate step numbers");
    assert_eq!(steps.len(), 6);
    assert_eq!(*steps.iter().min().expect("min"), 1);
    assert_eq!(*steps.iter().max().expect("max"), 6);
}

#[tokio::test]
async fn test_resume_of_terminal_run_is_a_noop() {
    let (tm, target) = seed_velocity_burst(3);
    let repos = TestRepos::new();
    let service = build_service(test_settings(), &repos, Arc::new(tm), None, None);

    let envelope = service
        .run_investigation(inquest::service::RunRequest {
            transaction_id: target,
            mode: inquest::state::InvestigationMode::Full,
            case_id: None,
            include_rule_draft_preview: false,
        })
        .await
        .expect("run");
    let version_before = repos
        .state_store
        .version_of(envelope.investigation_id)
        .expect("version");

    let resumed = service
        .resume(envelope.investigation_id)
        .await
        .expect("resume");
    assert_eq!(resumed.status, envelope.status);
    assert_eq!(resumed.step_count, envelope.step_count);

    let version_after = repos
        .state_store
        .version_of(envelope.investigation_id)
        .expect("version");
    assert_eq!(version_before, version_after, "terminal resume writes nothing");
}

#[tokio::test]
async fn test_resume_unknown_investigation_is_not_found() {
    let repos = TestRepos::new();
    let service = build_service(
        test_settings(),
        &repos,
        Arc::new(super::common::CannedTm::default()),
        None,
        None,
    );
    let err = service.resume(Uuid::new_v4()).await.expect_err("missing");
    assert_eq!(err.code(), "OPS_AGENT_NOT_FOUND");
    assert_eq!(err.http_status(), 404);
}
