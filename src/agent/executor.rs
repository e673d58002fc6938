//! Tool executor node: run the planner's selection under a deadline.
//!
//! All three outcomes — success, failure, timeout — append a
//! [`ToolExecution`] record and mark the tool completed so the planner
//! never re-selects it. A tool is never retried within one investigation;
//! the planner adapts instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::redaction::truncate_on_boundary;
use crate::state::{InvestigationState, ToolExecution, ToolStatus};
use crate::tools::{input_summary, output_summary, ToolRegistry};

/// Maximum length of a sanitized error message in the log.
const MAX_ERROR_CHARS: usize = 300;

/// The tool executor node.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    tool_timeout: Duration,
}

impl ToolExecutor {
    /// Create an executor over the registry with the per-tool deadline.
    pub fn new(registry: Arc<ToolRegistry>, tool_timeout: Duration) -> Self {
        Self {
            registry,
            tool_timeout,
        }
    }

    /// Execute `state.next_action`, returning a new state.
    pub async fn execute(&self, state: &InvestigationState) -> InvestigationState {
        let mut base = state.clone();
        let Some(tool_name) = base.next_action.take() else {
            return base;
        };

        let step_number = base.step_count;
        let input = input_summary(&tool_name, &base);
        let started = Instant::now();

        let Some(tool) = self.registry.get(&tool_name) else {
            // Unknown name: record a synthetic failure and blocklist it.
            base.tool_executions.push(ToolExecution {
                tool_name: tool_name.clone(),
                step_number,
                status: ToolStatus::Failed,
                input_summary: input,
                output_summary: String::new(),
                execution_time_ms: 0,
                error_message: Some(format!("unknown tool '{tool_name}'")),
                timestamp: Utc::now(),
            });
            base.mark_completed(&tool_name);
            return base;
        };

        match tokio::time::timeout(self.tool_timeout, tool.execute(&base)).await {
            Ok(Ok(new_state)) => {
                let mut next = new_state;
                next.next_action = None;
                let output = output_summary(&tool_name, &next);
                next.tool_executions.push(ToolExecution {
                    tool_name: tool_name.clone(),
                    step_number,
                    status: ToolStatus::Success,
                    input_summary: input,
                    output_summary: output,
                    execution_time_ms: elapsed_ms(started),
                    error_message: None,
                    timestamp: Utc::now(),
                });
                next.mark_completed(&tool_name);
                next
            }
            Ok(Err(e)) => {
                tracing::warn!(tool = %tool_name, error = %e, "tool execution failed");
                base.tool_executions.push(ToolExecution {
                    tool_name: tool_name.clone(),
                    step_number,
                    status: ToolStatus::Failed,
                    input_summary: input,
                    output_summary: String::new(),
                    execution_time_ms: elapsed_ms(started),
                    error_message: Some(
                        truncate_on_boundary(&e.to_string(), MAX_ERROR_CHARS).to_owned(),
                    ),
                    timestamp: Utc::now(),
                });
                base.mark_completed(&tool_name);
                base
            }
            Err(_) => {
                tracing::warn!(tool = %tool_name, "tool execution timed out");
                base.tool_executions.push(ToolExecution {
                    tool_name: tool_name.clone(),
                    step_number,
                    status: ToolStatus::TimedOut,
                    input_summary: input,
                    output_summary: String::new(),
                    execution_time_ms: elapsed_ms(started),
                    error_message: Some(format!(
                        "exceeded the {}s tool deadline",
                        self.tool_timeout.as_secs()
                    )),
                    timestamp: Utc::now(),
                });
                base.mark_completed(&tool_name);
                base
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoringSettings;
    use crate::state::{
        FeatureFlagsSnapshot, InvestigationMode, SafeguardsSnapshot,
    };
    use crate::tools::{AgentTool, PatternTool, RecommendationTool};
    use uuid::Uuid;

    fn registry() -> Arc<ToolRegistry> {
        Arc::new(ToolRegistry::new(vec![
            AgentTool::Pattern(PatternTool::new(ScoringSettings::default())),
            AgentTool::Recommendation(RecommendationTool::new()),
        ]))
    }

    fn state_with_action(action: Option<&str>) -> InvestigationState {
        let mut state = InvestigationState::new(
            Uuid::new_v4(),
            "txn_e".to_owned(),
            InvestigationMode::Full,
            FeatureFlagsSnapshot {
                planner_llm_enabled: false,
                vector_enabled: false,
                prompt_guard_enabled: true,
                rule_draft_export_enabled: false,
            },
            SafeguardsSnapshot {
                investigation_timeout_seconds: 120,
                tool_timeout_seconds: 30,
                planner_timeout_seconds: 10,
                max_steps: 20,
            },
            "model".to_owned(),
            Utc::now(),
        );
        state.step_count = 1;
        state.next_action = action.map(str::to_owned);
        state
    }

    #[tokio::test]
    async fn test_success_records_execution_and_completion() {
        let executor = ToolExecutor::new(registry(), Duration::from_secs(5));
        let state = state_with_action(Some("pattern_tool"));
        let next = executor.execute(&state).await;

        assert_eq!(next.tool_executions.len(), 1);
        let record = &next.tool_executions[0];
        assert_eq!(record.tool_name, "pattern_tool");
        assert_eq!(record.status, ToolStatus::Success);
        assert_eq!(record.step_number, 1);
        assert!(next.has_completed("pattern_tool"));
        assert!(next.next_action.is_none());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_blocklisted() {
        let executor = ToolExecutor::new(registry(), Duration::from_secs(5));
        let state = state_with_action(Some("bogus_tool"));
        let next = executor.execute(&state).await;

        let record = &next.tool_executions[0];
        assert_eq!(record.status, ToolStatus::Failed);
        assert!(record
            .error_message
            .as_deref()
            .expect("error")
            .contains("unknown tool"));
        assert!(next.has_completed("bogus_tool"));
    }

    #[tokio::test]
    async fn test_no_action_is_a_noop() {
        let executor = ToolExecutor::new(registry(), Duration::from_secs(5));
        let state = state_with_action(None);
        let next = executor.execute(&state).await;
        assert!(next.tool_executions.is_empty());
        assert!(next.completed_steps.is_empty());
    }

    #[tokio::test]
    async fn test_tool_never_runs_twice() {
        let executor = ToolExecutor::new(registry(), Duration::from_secs(5));
        let state = state_with_action(Some("pattern_tool"));
        let once = executor.execute(&state).await;
        let mut again = once.clone();
        again.next_action = Some("pattern_tool".to_owned());
        // The planner would never do this; the executor still records a
        // second execution rather than silently dropping it, but the
        // completed list stays deduplicated.
        let twice = executor.execute(&again).await;
        assert_eq!(
            twice
                .completed_steps
                .iter()
                .filter(|t| t.as_str() == "pattern_tool")
                .count(),
            1
        );
    }
}
