use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::error::Result;
use crate::event_log::EventLogger;
use crate::run_memory::RunMemory;
use crate::stage::StageExecutor;
use crate::types::{ExperimentPlan, Policy};

fn single_meta(key: &str, value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    map
}

/// Drives one accepted plan through SMOKE -> GRID -> AB -> SELECT -> PUBLISH.
/// A GRID reflection decision of `early_stop` ends the run right after GRID,
/// before any AB/SELECT/PUBLISH work is attempted.
pub struct Pipeline {
    stages: Arc<StageExecutor>,
    logger: Arc<EventLogger>,
    memory: Arc<RunMemory>,
    policies: Arc<HashMap<String, Policy>>,
}

impl Pipeline {
    pub fn new(stages: Arc<StageExecutor>, logger: Arc<EventLogger>, memory: Arc<RunMemory>, policies: Arc<HashMap<String, Policy>>) -> Self {
        Pipeline { stages, logger, memory, policies }
    }

    pub fn run(&self, run_id: &str, plan: &ExperimentPlan) -> Result<Value> {
        // The scheduler already registered the plan (with fingerprints
        // embedded) and initialized the event log before enqueueing; a
        // second `register_plan` here would wipe the per-run metadata
        // `RunMemory` just merged in since the last write.
        self.logger.initialize(run_id)?;
        self.logger.log_event(run_id, "RUN_STARTED", json!({"plan": plan.to_value_without_metadata()}))?;

        let outcome = self.run_stages(run_id, plan);

        match &outcome {
            Ok(summary) => {
                self.memory.update_metadata(run_id, single_meta("status", json!("completed")))?;
                self.logger.log_event(run_id, "RUN_COMPLETED", json!({"summary": summary}))?;
            }
            Err(err) => {
                self.memory.update_metadata(run_id, single_meta("status", json!("failed")))?;
                self.logger.log_event(run_id, "RUN_FAILED", json!({"error": err.to_payload()}))?;
            }
        }
        outcome
    }

    fn run_stages(&self, run_id: &str, plan: &ExperimentPlan) -> Result<Value> {
        self.stages.run_smoke(run_id, plan)?;
        let grid_summary = self.stages.run_grid(run_id, plan)?;

        if grid_summary.decision.action == "early_stop" {
            self.logger.log_event(
                run_id,
                "PIPELINE_EARLY_STOP",
                json!({"stage": "GRID", "reason": grid_summary.decision.reason}),
            )?;
            return Ok(json!({"status": "early_stopped", "stage": "GRID", "reason": grid_summary.decision.reason}));
        }

        let ab_summary = self.stages.run_ab(run_id, plan, &grid_summary, &self.policies)?;
        let winner = self.stages.select_winner(run_id, &grid_summary, &ab_summary)?;
        let artifacts = self.stages.publish(run_id, &grid_summary, &winner)?;

        Ok(json!({"status": "completed", "winner": winner.to_value(), "artifacts": artifacts}))
    }
}
