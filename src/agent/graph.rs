//! Graph runtime: planner -> router -> tool executor -> planner, with a
//! terminal completion node.
//!
//! The topology is small enough to implement directly: a loop with one
//! conditional router. Nodes are pure `state -> state` functions; after
//! every transition the snapshot is persisted, so the run can resume
//! from any point. The outer deadline wraps the loop; when it fires, the
//! latest snapshot is reloaded and the completion node still runs
//! (deferred finalization), persisting whatever evidence exists.

use std::sync::Arc;
use std::time::Duration;

use crate::error::ServiceError;
use crate::state::{InvestigationState, InvestigationStatus, ACTION_COMPLETE};
use crate::store::{InvestigationRepo, StateStore};
use crate::tools::ToolRegistry;

use super::completion::CompletionNode;
use super::executor::ToolExecutor;
use super::planner::Planner;

/// Where the router sends the state next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Run the selected tool.
    ToolExecutor,
    /// Finalize the investigation.
    Completion,
}

/// Conditional router between planner output and the next node.
pub fn route(state: &InvestigationState) -> Route {
    match state.next_action.as_deref() {
        None | Some(ACTION_COMPLETE) => Route::Completion,
        // step_count is post-increment here: a selection made at the cap
        // still executes, anything beyond it is forced to completion.
        Some(_) if state.step_count > state.max_steps => Route::Completion,
        Some(_) => Route::ToolExecutor,
    }
}

/// The investigation graph runtime.
pub struct InvestigationGraph {
    planner: Planner,
    executor: ToolExecutor,
    completion: CompletionNode,
    registry: Arc<ToolRegistry>,
    state_store: Arc<dyn StateStore>,
    investigations: Arc<dyn InvestigationRepo>,
}

impl InvestigationGraph {
    /// Assemble the graph from its nodes and stores.
    pub fn new(
        planner: Planner,
        executor: ToolExecutor,
        completion: CompletionNode,
        registry: Arc<ToolRegistry>,
        state_store: Arc<dyn StateStore>,
        investigations: Arc<dyn InvestigationRepo>,
    ) -> Self {
        Self {
            planner,
            executor,
            completion,
            registry,
            state_store,
            investigations,
        }
    }

    /// Drive one investigation to a terminal state. Also the resume entry
    /// point: pass the reloaded snapshot and the loop continues where it
    /// stopped.
    ///
    /// # Errors
    ///
    /// Fails only when the final investigation row update fails; every
    /// other problem is absorbed into state and audit records.
    pub async fn run(
        &self,
        state: InvestigationState,
    ) -> Result<InvestigationState, ServiceError> {
        let investigation_id = state.investigation_id;
        let budget = Duration::from_secs(state.safeguards.investigation_timeout_seconds.max(1));

        match tokio::time::timeout(budget, self.drive(state.clone())).await {
            Ok(finished) => self.completion.finalize(finished, false).await,
            Err(_) => {
                tracing::warn!(%investigation_id, "investigation deadline elapsed");
                // In-flight work is cancelled by dropping the future; the
                // last persisted snapshot is the truth now.
                let latest = self
                    .state_store
                    .load_state(investigation_id)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or(state);
                self.completion.finalize(latest, true).await
            }
        }
    }

    /// The planner/executor loop. Runs until the router picks completion.
    async fn drive(&self, mut state: InvestigationState) -> InvestigationState {
        let investigation_id = state.investigation_id;
        let mut row_in_progress = false;

        loop {
            let catalog = self.registry.catalog(state.mode);
            state = self.planner.plan(&state, &catalog).await;

            if !row_in_progress {
                if let Err(e) = self
                    .investigations
                    .set_status(investigation_id, InvestigationStatus::InProgress)
                    .await
                {
                    tracing::warn!(error = %e, "failed to flip investigation to IN_PROGRESS");
                }
                row_in_progress = true;
            }
            self.save_snapshot(&state).await;

            match route(&state) {
                Route::Completion => break,
                Route::ToolExecutor => {
                    state = self.executor.execute(&state).await;
                    self.save_snapshot(&state).await;
                }
            }
        }

        state
    }

    /// Persist a snapshot; a write failure is logged, not fatal, because
    /// the in-memory state remains authoritative for this run.
    async fn save_snapshot(&self, state: &InvestigationState) {
        if let Err(e) = self
            .state_store
            .save_state(state.investigation_id, state)
            .await
        {
            tracing::error!(
                investigation_id = %state.investigation_id,
                error = %e,
                "state snapshot write failed"
            );
        }
    }
}
