use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;

use serde_json::{json, Map, Value};

use crate::auditor::Auditor;
use crate::config::OrchestratorConfig;
use crate::error::{OrchError, Result};
use crate::event_log::EventLogger;
use crate::fingerprint::compute_fingerprints;
use crate::pipeline::Pipeline;
use crate::planner;
use crate::run_memory::RunMemory;
use crate::runner::RunnerAdapter;
use crate::types::{generate_run_id, utc_timestamp, Event, ExperimentPlan, FingerprintKey, Policy, PIPELINE_STAGES};

/// Intake gate and worker pool for accepted plans. `start` validates,
/// dedupes, and either returns a dry-run plan preview or enqueues the plan
/// onto a bounded FIFO drained by a fixed pool of `std::thread` workers.
pub struct Scheduler {
    config: Arc<OrchestratorConfig>,
    logger: Arc<EventLogger>,
    memory: Arc<RunMemory>,
    pipeline: Arc<Pipeline>,
    runner: Arc<RunnerAdapter>,
    auditor: Arc<dyn Auditor>,
    policies: Arc<HashMap<String, Policy>>,
    sender: SyncSender<(String, ExperimentPlan)>,
    in_flight: Arc<Mutex<HashMap<String, FingerprintKey>>>,
}

impl Scheduler {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        logger: Arc<EventLogger>,
        memory: Arc<RunMemory>,
        pipeline: Arc<Pipeline>,
        runner: Arc<RunnerAdapter>,
        auditor: Arc<dyn Auditor>,
        policies: Arc<HashMap<String, Policy>>,
    ) -> Arc<Self> {
        let (sender, receiver) = sync_channel(config.run.queue_size.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let in_flight = Arc::new(Mutex::new(HashMap::new()));

        let scheduler = Arc::new(Scheduler {
            config: Arc::clone(&config),
            logger,
            memory,
            pipeline,
            runner,
            auditor,
            policies,
            sender,
            in_flight,
        });

        for worker_id in 0..config.run.concurrency_limit.max(1) {
            let receiver: Arc<Mutex<Receiver<(String, ExperimentPlan)>>> = Arc::clone(&receiver);
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || loop {
                let next = { receiver.lock().unwrap_or_else(|e| e.into_inner()).recv() };
                match next {
                    Ok((run_id, plan)) => {
                        tracing::info!(worker_id, run_id, "dequeued run");
                        let _ = scheduler.pipeline.run(&run_id, &plan);
                        scheduler.in_flight.lock().unwrap_or_else(|e| e.into_inner()).remove(&run_id);
                    }
                    Err(_) => break,
                }
            });
        }
        scheduler
    }

    fn inject_policy_defaults(&self, plan: &mut ExperimentPlan) {
        let Some(name) = plan.baseline_id.clone().or_else(|| self.config.baseline_policy.clone()) else {
            return;
        };
        let Some(policy) = self.policies.get(&name) else {
            return;
        };
        plan.metadata.entry("queries_path".to_string()).or_insert(json!(policy.queries_path));
        plan.metadata.entry("qrels_path".to_string()).or_insert(json!(policy.qrels_path));
    }

    /// Every gate below mints its own throwaway run_id and logs its block
    /// event against it: the real run_id doesn't exist yet at intake time,
    /// but a rejection should still leave an event trail.
    fn log_gate_block(&self, event_type: &str, err: &OrchError) {
        let run_id = generate_run_id();
        let _ = self.logger.initialize(&run_id);
        let _ = self.logger.log_event(&run_id, event_type, json!({"error": err.to_payload()}));
    }

    fn validate_dataset(&self, dataset: &str) -> Result<()> {
        if self.config.datasets.disabled.iter().any(|d| d == dataset) {
            let err = OrchError::DatasetBlock {
                msg: format!("dataset `{dataset}` is disabled"),
                hint: Some("remove the dataset from datasets.disabled to re-enable it".to_string()),
                details: None,
            };
            self.log_gate_block("DATASET_BLOCK", &err);
            return Err(err);
        }
        if !self.config.datasets.whitelist.is_empty() && !self.config.datasets.whitelist.iter().any(|d| d == dataset) {
            let err = OrchError::DatasetBlock {
                msg: format!("dataset `{dataset}` is not in the allowed dataset list"),
                hint: Some(format!("add the dataset to datasets.whitelist: {:?}", self.config.datasets.whitelist)),
                details: None,
            };
            self.log_gate_block("DATASET_BLOCK", &err);
            return Err(err);
        }
        Ok(())
    }

    fn find_in_flight(&self, fingerprint: &FingerprintKey) -> Option<String> {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(_, fp)| *fp == fingerprint)
            .map(|(run_id, _)| run_id.clone())
    }

    /// Scans completed runs for a matching fingerprint. Reads `plan.fingerprints`,
    /// the key `register_plan` embeds at step 9 — not `RunRecord.metadata`,
    /// which a worker's own re-registration of the plan would otherwise wipe.
    fn find_completed(&self, fingerprint: &FingerprintKey) -> Option<String> {
        for run_id in self.memory.list_run_ids() {
            let Some(record) = self.memory.get(&run_id) else { continue };
            if record.metadata.get("status").and_then(Value::as_str) != Some("completed") {
                continue;
            }
            let Some(recorded) = record.plan.get("fingerprints") else { continue };
            let Ok(recorded_fp) = serde_json::from_value::<FingerprintKey>(recorded.clone()) else { continue };
            if &recorded_fp == fingerprint {
                return Some(run_id);
            }
        }
        None
    }

    fn check_budget(&self) -> Result<()> {
        let Some(max_concurrent) = self.config.budget.max_concurrent_runs else {
            return Ok(());
        };
        let active = self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len();
        if active >= max_concurrent {
            let err = OrchError::BudgetBlock {
                msg: format!("max_concurrent_runs ({max_concurrent}) reached"),
                hint: Some("wait for an in-flight run to finish before submitting another".to_string()),
            };
            self.log_gate_block("BUDGET_BLOCK", &err);
            return Err(err);
        }
        Ok(())
    }

    /// Picks the alignment-auditor's target host: an `allowed_hosts` entry
    /// carrying the configured `audit_port`, falling back to the runner's
    /// own base URL. Generic over backend rather than a hardcoded host/port.
    fn resolve_audit_host(&self) -> String {
        if let Some(port) = &self.config.audit_port {
            if let Some(host) = self.config.allowed_hosts.iter().find(|h| h.contains(port.as_str())) {
                return host.clone();
            }
        }
        self.config.base_url.clone()
    }

    /// Resolves `queries_path`/`qrels_path` from plan metadata first, falling
    /// back to the config's dataset-keyed maps.
    fn resolve_alignment_paths(&self, plan: &ExperimentPlan) -> (Option<String>, Option<String>) {
        let queries_path = plan
            .metadata
            .get("queries_path")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.config.datasets.queries_map.get(&plan.dataset).cloned());
        let qrels_path = plan
            .metadata
            .get("qrels_path")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.config.datasets.qrels_map.get(&plan.dataset).cloned());
        (queries_path, qrels_path)
    }

    /// Three-piece alignment validation: dataset, queries_path, and qrels_path
    /// must all be resolvable before anything else runs, independent of
    /// whether an alignment auditor is even configured.
    fn validate_alignment_paths(&self, plan: &ExperimentPlan) -> Result<()> {
        let (queries_path, qrels_path) = self.resolve_alignment_paths(plan);
        if queries_path.is_none() || qrels_path.is_none() {
            let err = OrchError::AlignmentBlock {
                msg: format!("dataset `{}` has no resolvable queries_path/qrels_path", plan.dataset),
                hint: Some("set datasets.queries_map/qrels_map or supply queries_path/qrels_path in plan metadata".to_string()),
                details: None,
            };
            self.log_gate_block("ALIGNMENT_BLOCK", &err);
            return Err(err);
        }
        Ok(())
    }

    /// Invokes the alignment auditor subprocess. A no-op when none is
    /// configured — the three-piece path validation above still ran.
    fn audit_alignment(&self, plan: &ExperimentPlan) -> Result<()> {
        if self.config.audit_cmd.trim().is_empty() {
            return Ok(());
        }
        let (_, qrels_path) = self.resolve_alignment_paths(plan);
        let qrels_path = qrels_path.unwrap_or_default();

        let host = self.resolve_audit_host();
        let report = self.auditor.audit(&host, &plan.dataset, &qrels_path).map_err(|err| {
            self.log_gate_block("ALIGNMENT_BLOCK", &err);
            err
        })?;
        if report.mismatch_rate > 0.0 {
            let err = OrchError::AlignmentBlock {
                msg: format!("alignment audit found {} mismatches out of {} checked", report.mismatch, report.checked),
                hint: Some("re-index the collection or regenerate qrels before running".to_string()),
                details: Some(serde_json::to_value(&report)?),
            };
            self.log_gate_block("ALIGNMENT_BLOCK", &err);
            return Err(err);
        }
        Ok(())
    }

    /// A health-check failure here is logged (`DRY_RUN_HEALTH_FAIL`) but does
    /// not abort dry-run plan computation: the grid is still built and returned.
    fn dry_run_plan(&self, run_id: &str, plan: &ExperimentPlan, fingerprint: &FingerprintKey) -> Result<Value> {
        if !self.config.mock_runner {
            if let Err(err) = self.runner.check_backend_health() {
                tracing::warn!(%err, "DRY_RUN_HEALTH_FAIL");
                let _ = self.logger.log_event(run_id, "DRY_RUN_HEALTH_FAIL", json!({"error": err.to_payload()}));
            }
        }
        let batches = planner::make_grid(plan, &self.config)?;
        let total_tasks: u64 = batches.iter().map(|b| b.tasks.len() as u64).sum();
        let payload = json!({
            "batches": batches.len(),
            "total_tasks": total_tasks,
            "estimated_duration_s": total_tasks * 2 + 10,
            "stages": PIPELINE_STAGES.to_vec(),
        });
        self.logger.log_event(run_id, "DRY_RUN_PLAN", payload.clone())?;

        let mut result = payload;
        result["status"] = json!("dry_run");
        result["run_id"] = json!(run_id);
        result["fingerprint"] = serde_json::to_value(fingerprint)?;
        Ok(result)
    }

    /// Validates, dedupes, and either previews (`dry_run`) or enqueues a plan.
    /// `commit=false` forces `dry_run=true` regardless of the caller's `dry_run`
    /// argument — the safety default so a client can never trigger a real run
    /// by omission.
    pub fn start(&self, mut plan: ExperimentPlan, dry_run: Option<bool>, commit: bool) -> Result<Value> {
        let dry_run = if !commit { true } else { dry_run.unwrap_or(self.config.run.dry_run_default) };

        self.inject_policy_defaults(&mut plan);
        self.validate_alignment_paths(&plan)?;

        let fingerprint = compute_fingerprints(&plan, &self.config);
        if let Some(existing) = self.find_in_flight(&fingerprint).or_else(|| self.find_completed(&fingerprint)) {
            return Ok(json!({"status": "duplicate", "run_id": existing, "fingerprint": fingerprint}));
        }

        self.validate_dataset(&plan.dataset)?;
        self.audit_alignment(&plan)?;
        self.check_budget()?;

        let run_id = generate_run_id();
        self.logger.initialize(&run_id)?;
        self.logger.log_event(&run_id, "RUN_STARTED", json!({"fingerprint": fingerprint, "dry_run": dry_run}))?;

        let mut plan_value = plan.to_value();
        if let Value::Object(ref mut map) = plan_value {
            map.insert("fingerprints".to_string(), serde_json::to_value(&fingerprint)?);
        }
        self.memory.register_plan(&run_id, plan_value)?;
        let mut meta = Map::new();
        meta.insert("fingerprint".to_string(), serde_json::to_value(&fingerprint)?);
        meta.insert("dry_run".to_string(), json!(dry_run));
        meta.insert("started_at".to_string(), json!(utc_timestamp()));
        self.memory.update_metadata(&run_id, meta)?;

        if dry_run {
            return self.dry_run_plan(&run_id, &plan, &fingerprint);
        }

        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).insert(run_id.clone(), fingerprint.clone());
        match self.sender.try_send((run_id.clone(), plan)) {
            Ok(()) => Ok(json!({"status": "queued", "run_id": run_id, "fingerprint": fingerprint})),
            Err(_) => {
                self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).remove(&run_id);
                Err(OrchError::QueueFull { msg: "scheduler queue is full".to_string() })
            }
        }
    }

    fn collect_reflections(&self, events: &[Event]) -> Vec<Value> {
        events
            .iter()
            .filter(|e| e.event_type.ends_with("_REFLECTION"))
            .map(|e| {
                let stage = e.event_type.trim_end_matches("_REFLECTION").to_string();
                json!({
                    "stage": stage,
                    "model": e.payload.get("model").cloned().unwrap_or(Value::Null),
                    "rationale_md": e.payload.get("rationale_md_lite").cloned().unwrap_or(json!("")),
                    "next_actions": e.payload.get("next_actions").cloned().unwrap_or(json!([])),
                })
            })
            .collect()
    }

    /// Replays a run's event log in reverse to derive its current state:
    /// a `RUN_FAILED`/`RUN_COMPLETED` terminal event wins outright; otherwise
    /// the most recent `<STAGE>_STARTED`/`<STAGE>_DONE` pair sets the current
    /// stage, and every `<STAGE>_DONE` seen contributes to `completed_stages`
    /// and (the first time) to `latest_metrics`.
    pub fn get_status(&self, run_id: &str) -> Result<Value> {
        let record = self.memory.get(run_id).ok_or_else(|| OrchError::NotFound { msg: format!("run `{run_id}` not found") })?;
        let events = self.logger.read_events(run_id, None);

        let mut status = "pending".to_string();
        let mut current_stage: Option<String> = None;
        let mut error: Option<Value> = None;
        let mut latest_metrics: Option<Value> = None;
        let mut completed_stages: Vec<String> = Vec::new();

        for event in events.iter().rev() {
            match event.event_type.as_str() {
                "RUN_FAILED" => {
                    status = "failed".to_string();
                    error = event.payload.get("error").cloned();
                    break;
                }
                "RUN_COMPLETED" => {
                    status = "completed".to_string();
                    break;
                }
                other if other != "RUN_STARTED" && other.ends_with("_DONE") => {
                    let stage = other.trim_end_matches("_DONE").to_string();
                    if !completed_stages.contains(&stage) {
                        completed_stages.push(stage.clone());
                    }
                    if latest_metrics.is_none() {
                        latest_metrics = event.payload.get("metrics").cloned();
                    }
                    if current_stage.is_none() {
                        current_stage = Some(stage);
                        status = "running".to_string();
                    }
                }
                other if other != "RUN_STARTED" && other.ends_with("_STARTED") => {
                    if current_stage.is_none() {
                        current_stage = Some(other.trim_end_matches("_STARTED").to_string());
                        status = "running".to_string();
                    }
                }
                _ => {}
            }
        }

        let progress = if status == "completed" {
            1.0
        } else {
            completed_stages.len() as f64 / PIPELINE_STAGES.len() as f64
        };

        Ok(json!({
            "run_id": run_id,
            "status": status,
            "progress": progress,
            "current_stage": current_stage,
            "completed_stages": completed_stages,
            "latest_metrics": latest_metrics,
            "error": error,
            "reflections": self.collect_reflections(&events),
            "plan": record.plan,
            "metadata": record.metadata,
        }))
    }

    /// Returns the PUBLISH stage's artifact map when present; otherwise falls
    /// back to whatever partial GRID/AB artifacts exist so a caller can still
    /// inspect a run that never reached PUBLISH.
    pub fn get_report_artifacts(&self, run_id: &str) -> Result<Value> {
        let record = self.memory.get(run_id).ok_or_else(|| OrchError::NotFound { msg: format!("run `{run_id}` not found") })?;

        if let Some(artifacts) = record.metadata.get("publish") {
            return Ok(artifacts.clone());
        }

        let mut fallback = Map::new();
        if let Some(grid) = record.metadata.get("grid") {
            fallback.insert("grid".to_string(), grid.clone());
        }
        if let Some(ab) = record.metadata.get("ab") {
            fallback.insert("ab".to_string(), ab.clone());
        }
        if fallback.is_empty() {
            return Err(OrchError::NotFound { msg: format!("no artifacts available yet for run `{run_id}`") });
        }
        Ok(Value::Object(fallback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auditor::MockAuditor;
    use crate::reflector::ReflectionCache;
    use crate::stage::StageExecutor;
    use crate::types::SearchSpace;

    fn test_plan(dataset: &str) -> ExperimentPlan {
        let mut plan = ExperimentPlan {
            dataset: dataset.to_string(),
            sample_size: 20,
            search_space: SearchSpace {
                top_k: vec![json!(10)],
                mmr: vec![json!(false)],
                ef_search: vec![json!(32)],
            },
            budget: Default::default(),
            concurrency: Some(1),
            baseline_id: None,
            metadata: Default::default(),
        };
        plan.metadata.insert("queries_path".to_string(), json!(format!("/data/{dataset}/queries.jsonl")));
        plan.metadata.insert("qrels_path".to_string(), json!(format!("/data/{dataset}/qrels.tsv")));
        plan
    }

    fn build_scheduler(dir: &std::path::Path) -> Arc<Scheduler> {
        let mut config = OrchestratorConfig::default();
        config.mock_runner = true;
        config.runs_dir = dir.join("runs");
        config.reports_dir = dir.join("reports");
        config.run.queue_size = 4;
        config.run.concurrency_limit = 1;
        let config = Arc::new(config);

        let logger = Arc::new(EventLogger::new(dir.join("events")));
        let memory = Arc::new(RunMemory::new(dir.join("memory")));
        let runner = Arc::new(RunnerAdapter::new((*config).clone()));
        let reflection_cache = Arc::new(ReflectionCache::new(dir.join("reflection.jsonl")));
        let stages = Arc::new(StageExecutor::new(
            Arc::clone(&config),
            Arc::clone(&logger),
            Arc::clone(&memory),
            Arc::clone(&runner),
            reflection_cache,
        ));
        let policies = Arc::new(HashMap::new());
        let pipeline = Arc::new(Pipeline::new(stages, Arc::clone(&logger), Arc::clone(&memory), Arc::clone(&policies)));
        let auditor = Arc::new(MockAuditor);

        Scheduler::new(config, logger, memory, pipeline, runner, auditor, policies)
    }

    #[test]
    fn dry_run_does_not_enqueue() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = build_scheduler(dir.path());
        let result = scheduler.start(test_plan("fiqa"), Some(true), true).unwrap();
        assert_eq!(result["status"], "dry_run");
        assert!(result["total_tasks"].as_u64().unwrap() > 0);
        assert!(result["estimated_duration_s"].as_u64().unwrap() > 0);
        assert_eq!(result["stages"].as_array().unwrap().len(), PIPELINE_STAGES.len());
    }

    #[test]
    fn commit_false_forces_dry_run() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = build_scheduler(dir.path());
        // Explicit `dry_run: Some(false)` is overridden by `commit: false`.
        let result = scheduler.start(test_plan("fiqa"), Some(false), false).unwrap();
        assert_eq!(result["status"], "dry_run");
    }

    #[test]
    fn disabled_dataset_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = build_scheduler(dir.path());
        let plan = test_plan("forbidden");
        let scheduler = {
            let mut config = (*scheduler.config).clone();
            config.datasets.disabled = vec!["forbidden".to_string()];
            let config = Arc::new(config);
            Scheduler::new(
                config,
                Arc::clone(&scheduler.logger),
                Arc::clone(&scheduler.memory),
                Arc::clone(&scheduler.pipeline),
                Arc::clone(&scheduler.runner),
                Arc::clone(&scheduler.auditor),
                Arc::clone(&scheduler.policies),
            )
        };
        let err = scheduler.start(plan, Some(true), true).unwrap_err();
        assert_eq!(err.kind(), "DatasetBlock");
    }

    #[test]
    fn queued_run_completes_and_status_reports_completed() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = build_scheduler(dir.path());
        let result = scheduler.start(test_plan("fiqa"), Some(false), true).unwrap();
        assert_eq!(result["status"], "queued");
        let run_id = result["run_id"].as_str().unwrap().to_string();

        let mut status = scheduler.get_status(&run_id).unwrap();
        for _ in 0..200 {
            if status["status"] == "completed" || status["status"] == "failed" {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
            status = scheduler.get_status(&run_id).unwrap();
        }
        assert_eq!(status["status"], "completed");
    }

    #[test]
    fn idempotency_holds_after_simulated_restart() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = build_scheduler(dir.path());
        let result = scheduler.start(test_plan("fiqa"), Some(false), true).unwrap();
        assert_eq!(result["status"], "queued");
        let run_id = result["run_id"].as_str().unwrap().to_string();

        let mut status = scheduler.get_status(&run_id).unwrap();
        for _ in 0..200 {
            if status["status"] == "completed" || status["status"] == "failed" {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
            status = scheduler.get_status(&run_id).unwrap();
        }
        assert_eq!(status["status"], "completed");

        // A fresh Scheduler over the same on-disk memory simulates a process
        // restart: `find_completed` must still recognize the fingerprint
        // embedded in the stored plan, since the in-flight map is gone.
        let scheduler2 = build_scheduler(dir.path());
        let dup = scheduler2.start(test_plan("fiqa"), Some(false), true).unwrap();
        assert_eq!(dup["status"], "duplicate");
        assert_eq!(dup["run_id"], run_id);
    }

    #[test]
    fn get_status_missing_run_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = build_scheduler(dir.path());
        let err = scheduler.get_status("does-not-exist").unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }
}
