use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Map, Value};

use crate::config::OrchestratorConfig;
use crate::error::{OrchError, Result};
use crate::event_log::EventLogger;
use crate::metrics::MetricsAggregator;
use crate::planner;
use crate::publisher::ArtifactPublisher;
use crate::reflector::{self, ReflectionCache};
use crate::run_memory::RunMemory;
use crate::runner::RunnerAdapter;
use crate::sla::verify_sla;
use crate::types::{ExperimentPlan, Policy, ReflectionDecision, ReflectionResult};

#[derive(Debug, Clone)]
pub struct GridSummary {
    pub decision: ReflectionDecision,
    pub aggregate: Value,
    pub tasks: Vec<Value>,
    pub metrics_paths: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AbSummary {
    pub baseline_policy: Option<String>,
    pub candidate: Value,
    pub result: Value,
}

#[derive(Debug, Clone)]
pub struct Winner {
    pub config_id: String,
    pub metrics: Value,
    pub parameters: Value,
    pub job_id: Option<String>,
}

impl Winner {
    pub fn to_value(&self) -> Value {
        json!({"config_id": self.config_id, "metrics": self.metrics, "parameters": self.parameters, "job_id": self.job_id})
    }
}

fn single_meta(key: &str, value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    map
}

/// Filters to `status == "ok"` and stable-sorts by `(-recall_at_10, p95_ms,
/// cost)`. Shared by the AB and SELECT stages. The artifact publisher's
/// Pareto front uses a different, 2-key sort over the same rows.
pub(crate) fn rank_configs(tasks: &[Value]) -> Vec<Value> {
    let mut ranked: Vec<Value> = tasks
        .iter()
        .filter(|t| t.get("status").and_then(Value::as_str) == Some("ok"))
        .cloned()
        .collect();
    ranked.sort_by(|a, b| {
        let ra = a["metrics"]["recall_at_10"].as_f64().unwrap_or(0.0);
        let rb = b["metrics"]["recall_at_10"].as_f64().unwrap_or(0.0);
        rb.partial_cmp(&ra)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let pa = a["metrics"]["p95_ms"].as_f64().unwrap_or(f64::MAX);
                let pb = b["metrics"]["p95_ms"].as_f64().unwrap_or(f64::MAX);
                pa.partial_cmp(&pb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| {
                let ca = a["metrics"]["cost"].as_f64().unwrap_or(f64::MAX);
                let cb = b["metrics"]["cost"].as_f64().unwrap_or(f64::MAX);
                ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
            })
    });
    ranked
}

/// Runs the five pipeline stages against a single accepted plan. Every stage
/// follows the same shape: emit `<STAGE>_STARTED`, run the body, persist into
/// `RunMemory`, emit `<STAGE>_DONE`, invoke the reflector's `summarize`; on
/// error emit `<STAGE>_FAILED` and propagate. Health checks are skipped
/// entirely under `mock_runner`, matching the runner adapter's own mock path.
pub struct StageExecutor {
    config: Arc<OrchestratorConfig>,
    logger: Arc<EventLogger>,
    memory: Arc<RunMemory>,
    runner: Arc<RunnerAdapter>,
    reflection_cache: Arc<ReflectionCache>,
}

impl StageExecutor {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        logger: Arc<EventLogger>,
        memory: Arc<RunMemory>,
        runner: Arc<RunnerAdapter>,
        reflection_cache: Arc<ReflectionCache>,
    ) -> Self {
        StageExecutor { config, logger, memory, runner, reflection_cache }
    }

    fn spent_cost(&self, run_id: &str) -> f64 {
        self.memory
            .get(run_id)
            .and_then(|r| r.metadata.get("reflection_spent_cost").and_then(Value::as_f64))
            .unwrap_or(0.0)
    }

    fn run_reflection(&self, run_id: &str, stage: &str, kpis: Value) -> Result<ReflectionResult> {
        let metrics = kpis.get("metrics").cloned().unwrap_or(json!({}));
        let sla = verify_sla(&metrics, self.config.sla_policy_path.as_deref());
        let sla_value = serde_json::to_value(&sla)?;
        let spent = self.spent_cost(run_id);
        let result = reflector::summarize(stage, &kpis, &sla_value, &self.config.llm, &self.reflection_cache, spent);

        self.memory
            .update_metadata(run_id, single_meta("reflection_spent_cost", json!(spent + result.cost_usd)))?;

        self.logger.log_stage_event(
            run_id,
            stage,
            "reflection",
            json!({
                "model": result.model,
                "tokens": result.tokens,
                "cost_usd": result.cost_usd,
                "confidence": result.confidence,
                "cache_hit": result.cache_hit,
                "blocked": result.blocked,
                "elapsed_ms": result.elapsed_ms,
                "rationale_md_lite": result.rationale_md_lite,
                "next_actions": result.next_actions,
                "sla": sla_value,
            }),
        )?;

        Ok(result)
    }

    fn fail_stage(&self, run_id: &str, stage: &str, err: &OrchError, duration_ms: u64) -> Result<()> {
        self.memory.update_metadata(
            run_id,
            single_meta(&stage.to_lowercase(), json!({"status": "failed", "error": err.to_string()})),
        )?;
        self.logger
            .log_stage_event(run_id, stage, "failed", json!({"duration_ms": duration_ms, "error": err.to_payload()}))
    }

    fn log_abort_reason(&self, run_id: &str, stage: &str, err: &OrchError, duration_ms: u64) -> Result<()> {
        match err {
            OrchError::HealthCheck { .. } => {
                self.logger
                    .log_event(run_id, "HEALTH_FAIL", json!({"stage": stage, "duration_ms": duration_ms, "error": err.to_payload()}))
            }
            OrchError::RunnerTimeout { .. } => {
                self.logger
                    .log_event(run_id, "RUNNER_TIMEOUT", json!({"stage": stage, "duration_ms": duration_ms, "error": err.to_payload()}))
            }
            _ => Ok(()),
        }
    }

    pub fn run_smoke(&self, run_id: &str, plan: &ExperimentPlan) -> Result<Value> {
        let stage = "SMOKE";
        self.logger.log_stage_event(run_id, stage, "started", json!({}))?;
        let started = Instant::now();

        let body = (|| -> Result<Value> {
            if !self.config.mock_runner {
                self.runner.check_backend_health()?;
            }
            let outcome = self.runner.run_smoke(&plan.dataset, plan.sample_size)?;
            let metrics = MetricsAggregator::aggregate(&[outcome.metrics_path.clone()])?;
            Ok(json!({"job_id": outcome.job_id, "metrics": metrics}))
        })();

        let duration_ms = started.elapsed().as_millis() as u64;
        match body {
            Ok(smoke_result) => {
                self.memory.update_metadata(run_id, single_meta("smoke", smoke_result.clone()))?;
                self.logger.log_stage_event(
                    run_id,
                    stage,
                    "done",
                    json!({"duration_ms": duration_ms, "job_id": smoke_result["job_id"], "metrics": smoke_result["metrics"]}),
                )?;
                self.run_reflection(run_id, stage, json!({"metrics": smoke_result["metrics"], "duration_ms": duration_ms}))?;
                Ok(smoke_result["metrics"].clone())
            }
            Err(err) => {
                self.log_abort_reason(run_id, stage, &err, duration_ms)?;
                self.fail_stage(run_id, stage, &err, duration_ms)?;
                Err(err)
            }
        }
    }

    pub fn run_grid(&self, run_id: &str, plan: &ExperimentPlan) -> Result<GridSummary> {
        let stage = "GRID";
        self.logger.log_stage_event(run_id, stage, "started", json!({}))?;
        let started = Instant::now();

        let body = (|| -> Result<GridSummary> {
            if !self.config.mock_runner {
                self.runner.check_backend_health()?;
            }

            let batches = planner::make_grid(plan, &self.config)?;
            let mut batch_results: Vec<Value> = Vec::new();
            let mut metrics_paths: Vec<std::path::PathBuf> = Vec::new();

            for batch in &batches {
                self.logger.log_event(
                    run_id,
                    "GRID_BATCH_STARTED",
                    json!({"stage": stage, "batch_id": batch.batch_id, "concurrency": batch.concurrency, "task_count": batch.tasks.len()}),
                )?;

                for task in &batch.tasks {
                    match self.runner.run_grid_task(task.parameters.clone()) {
                        Ok(outcome) => match MetricsAggregator::aggregate(&[outcome.metrics_path.clone()]) {
                            Ok(metrics) => {
                                metrics_paths.push(outcome.metrics_path.clone());
                                self.logger.log_event(
                                    run_id,
                                    "GRID_TASK_DONE",
                                    json!({"stage": stage, "batch_id": batch.batch_id, "config_id": task.config_id, "job_id": outcome.job_id, "metrics": metrics}),
                                )?;
                                batch_results.push(json!({
                                    "config_id": task.config_id, "status": "ok", "metrics": metrics,
                                    "job_id": outcome.job_id, "parameters": task.parameters,
                                }));
                            }
                            // A metrics.json that fails to parse is a per-task failure, not a
                            // stage abort: the batch keeps going.
                            Err(err) => {
                                self.logger.log_event(
                                    run_id,
                                    "GRID_TASK_FAILED",
                                    json!({"stage": stage, "batch_id": batch.batch_id, "config_id": task.config_id, "error": err.to_string()}),
                                )?;
                                batch_results.push(json!({
                                    "config_id": task.config_id, "status": "error", "error": err.to_string(),
                                    "metrics": {}, "parameters": task.parameters,
                                }));
                            }
                        },
                        // Timeout/health-check failures abort the whole GRID stage rather
                        // than being recorded as a per-task failure.
                        Err(err @ (OrchError::RunnerTimeout { .. } | OrchError::HealthCheck { .. })) => return Err(err),
                        Err(err) => {
                            self.logger.log_event(
                                run_id,
                                "GRID_TASK_FAILED",
                                json!({"stage": stage, "batch_id": batch.batch_id, "config_id": task.config_id, "error": err.to_string()}),
                            )?;
                            batch_results.push(json!({
                                "config_id": task.config_id, "status": "error", "error": err.to_string(),
                                "metrics": {}, "parameters": task.parameters,
                            }));
                        }
                    }
                }

                self.logger.log_event(
                    run_id,
                    "GRID_BATCH_DONE",
                    json!({"stage": stage, "batch_id": batch.batch_id, "completed_tasks": batch.tasks.len()}),
                )?;
            }

            let aggregate = if metrics_paths.is_empty() {
                json!({})
            } else {
                MetricsAggregator::aggregate(&metrics_paths).unwrap_or(json!({}))
            };
            let decision = reflector::post_phase_reflect(
                run_id,
                stage,
                &batch_results,
                self.config.reflection.failure_rate,
                self.config.reflection.recall_variance,
                Some(&self.logger),
            );

            Ok(GridSummary {
                decision,
                aggregate,
                tasks: batch_results,
                metrics_paths: metrics_paths.iter().map(|p| p.to_string_lossy().into_owned()).collect(),
            })
        })();

        let duration_ms = started.elapsed().as_millis() as u64;
        match body {
            Ok(summary) => {
                self.memory.update_metadata(
                    run_id,
                    single_meta(
                        "grid",
                        json!({"aggregated_metrics": summary.aggregate, "tasks": summary.tasks, "decision": summary.decision.to_value()}),
                    ),
                )?;
                self.logger.log_stage_event(
                    run_id,
                    stage,
                    "done",
                    json!({"duration_ms": duration_ms, "metrics": summary.aggregate, "decision": summary.decision.to_value()}),
                )?;
                self.run_reflection(run_id, stage, json!({"metrics": summary.aggregate, "duration_ms": duration_ms}))?;
                Ok(summary)
            }
            Err(err) => {
                self.log_abort_reason(run_id, stage, &err, duration_ms)?;
                self.fail_stage(run_id, stage, &err, duration_ms)?;
                Err(err)
            }
        }
    }

    pub fn run_ab(&self, run_id: &str, plan: &ExperimentPlan, grid_summary: &GridSummary, policies: &HashMap<String, Policy>) -> Result<AbSummary> {
        let stage = "AB";
        self.logger.log_stage_event(run_id, stage, "started", json!({}))?;
        let started = Instant::now();

        let body = (|| -> Result<AbSummary> {
            let ranked = rank_configs(&grid_summary.tasks);
            let challenger = ranked
                .first()
                .cloned()
                .ok_or_else(|| OrchError::plan_invalid("no successful grid configurations available for the A/B stage"))?;

            let baseline_name = plan.baseline_id.clone().or_else(|| self.config.baseline_policy.clone());
            let baseline_policy = baseline_name
                .as_deref()
                .and_then(|name| policies.get(name))
                .ok_or_else(|| OrchError::plan_invalid("baseline policy is not configured or not found"))?;

            if !self.config.mock_runner {
                self.runner.check_backend_health()?;
            }

            let ab_cfg = &self.config.ab;
            let sample = ab_cfg.sample.unwrap_or(plan.sample_size);
            let concurrency = ab_cfg.concurrency.unwrap_or(1);

            let baseline_params = json!({
                "dataset": baseline_policy.dataset,
                "sample": sample,
                "top_k": baseline_policy.top_k,
                "mmr": baseline_policy.mmr.as_bool().unwrap_or(false),
                "mmr_lambda": baseline_policy.mmr_lambda.unwrap_or(0.0),
                "ef_search": baseline_policy.ef_search,
                "concurrency": concurrency,
            });
            let mut challenger_params = challenger["parameters"].clone();
            challenger_params["sample"] = json!(sample);

            let baseline_outcome = self.runner.run_ab_task(baseline_params)?;
            let baseline_metrics = MetricsAggregator::aggregate(&[baseline_outcome.metrics_path.clone()])?;

            let challenger_outcome = self.runner.run_ab_task(challenger_params.clone())?;
            let challenger_metrics = MetricsAggregator::aggregate(&[challenger_outcome.metrics_path.clone()])?;

            let diff = json!({
                "recall_at_10": challenger_metrics["recall_at_10"].as_f64().unwrap_or(0.0) - baseline_metrics["recall_at_10"].as_f64().unwrap_or(0.0),
                "p95_ms": challenger_metrics["p95_ms"].as_f64().unwrap_or(0.0) - baseline_metrics["p95_ms"].as_f64().unwrap_or(0.0),
                "cost": challenger_metrics["cost"].as_f64().unwrap_or(0.0) - baseline_metrics["cost"].as_f64().unwrap_or(0.0),
            });

            let run_dir = self.config.reports_dir.join(run_id);
            let chart_path = run_dir.join("ab_diff.png");
            let csv_path = run_dir.join("ab_diff.csv");
            ArtifactPublisher::render_ab_chart(&baseline_metrics, &challenger_metrics, &chart_path)?;
            ArtifactPublisher::write_ab_diff_csv(&baseline_metrics, &challenger_metrics, &csv_path)?;

            let candidate = json!({
                "config_id": challenger["config_id"], "parameters": challenger_params,
                "metrics": challenger_metrics, "job_id": challenger_outcome.job_id,
            });
            let ab_result = json!({
                "baseline": {"policy": baseline_name, "metrics": baseline_metrics, "job_id": baseline_outcome.job_id},
                "challenger": candidate,
                "diff": diff,
                "chart_path": chart_path.to_string_lossy(),
                "csv_path": csv_path.to_string_lossy(),
            });

            Ok(AbSummary { baseline_policy: baseline_name, candidate, result: ab_result })
        })();

        let duration_ms = started.elapsed().as_millis() as u64;
        match body {
            Ok(summary) => {
                self.memory.update_metadata(run_id, single_meta("ab", summary.result.clone()))?;
                self.logger
                    .log_stage_event(run_id, stage, "done", json!({"duration_ms": duration_ms, "result": summary.result}))?;
                self.run_reflection(run_id, stage, json!({"metrics": summary.candidate["metrics"], "duration_ms": duration_ms}))?;
                Ok(summary)
            }
            Err(err) => {
                self.log_abort_reason(run_id, stage, &err, duration_ms)?;
                self.fail_stage(run_id, stage, &err, duration_ms)?;
                Err(err)
            }
        }
    }

    pub fn select_winner(&self, run_id: &str, grid_summary: &GridSummary, ab_summary: &AbSummary) -> Result<Winner> {
        let stage = "SELECT";
        self.logger.log_stage_event(run_id, stage, "started", json!({}))?;
        let started = Instant::now();

        let body = (|| -> Result<Winner> {
            let ranked = rank_configs(&grid_summary.tasks);
            let ab_diff = ab_summary.result.get("diff").cloned().unwrap_or(json!({}));
            let challenger_beats_baseline = ab_diff.get("recall_at_10").and_then(Value::as_f64).unwrap_or(0.0) >= 0.0;

            let winner_value = if challenger_beats_baseline {
                ab_summary.candidate.clone()
            } else {
                ranked
                    .first()
                    .cloned()
                    .ok_or_else(|| OrchError::plan_invalid("no successful grid configurations available to select a winner"))?
            };

            Ok(Winner {
                config_id: winner_value["config_id"].as_str().unwrap_or("unknown").to_string(),
                metrics: winner_value.get("metrics").cloned().unwrap_or(json!({})),
                parameters: winner_value.get("parameters").cloned().unwrap_or(json!({})),
                job_id: winner_value.get("job_id").and_then(Value::as_str).map(str::to_string),
            })
        })();

        let duration_ms = started.elapsed().as_millis() as u64;
        match body {
            Ok(winner) => {
                self.memory.update_metadata(run_id, single_meta("select", winner.to_value()))?;
                self.logger
                    .log_stage_event(run_id, stage, "done", json!({"duration_ms": duration_ms, "winner": winner.to_value()}))?;
                self.run_reflection(run_id, stage, json!({"metrics": winner.metrics, "duration_ms": duration_ms}))?;
                Ok(winner)
            }
            Err(err) => {
                self.fail_stage(run_id, stage, &err, duration_ms)?;
                Err(err)
            }
        }
    }

    pub fn publish(&self, run_id: &str, grid_summary: &GridSummary, winner: &Winner) -> Result<Value> {
        let stage = "PUBLISH";
        self.logger.log_stage_event(run_id, stage, "started", json!({}))?;
        let started = Instant::now();

        let body = ArtifactPublisher::publish(
            &self.config.reports_dir,
            run_id,
            &winner.to_value(),
            &grid_summary.tasks,
            self.config.winners_source.as_deref(),
        );

        let duration_ms = started.elapsed().as_millis() as u64;
        match body {
            Ok(artifacts) => {
                self.memory.update_metadata(run_id, single_meta("publish", artifacts.clone()))?;
                self.logger
                    .log_stage_event(run_id, stage, "done", json!({"duration_ms": duration_ms, "artifacts": artifacts}))?;
                self.run_reflection(run_id, stage, json!({"metrics": winner.metrics, "duration_ms": duration_ms}))?;
                Ok(artifacts)
            }
            Err(err) => {
                self.fail_stage(run_id, stage, &err, duration_ms)?;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(config_id: &str, status: &str, recall: f64, p95: f64) -> Value {
        json!({"config_id": config_id, "status": status, "metrics": {"recall_at_10": recall, "p95_ms": p95, "cost": 0.01}, "parameters": {}})
    }

    #[test]
    fn rank_configs_drops_errors_and_sorts_by_recall_then_latency() {
        let tasks = vec![
            task("a", "ok", 0.5, 100.0),
            task("b", "error", 0.9, 10.0),
            task("c", "ok", 0.8, 50.0),
            task("d", "ok", 0.8, 30.0),
        ];
        let ranked = rank_configs(&tasks);
        let ids: Vec<&str> = ranked.iter().map(|t| t["config_id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["d", "c", "a"]);
    }

    #[test]
    fn winner_to_value_round_trips_fields() {
        let winner = Winner {
            config_id: "fiqa-k10-ef32-nommr".to_string(),
            metrics: json!({"recall_at_10": 0.8}),
            parameters: json!({"top_k": 10}),
            job_id: Some("grid-abc123".to_string()),
        };
        let value = winner.to_value();
        assert_eq!(value["config_id"], "fiqa-k10-ef32-nommr");
        assert_eq!(value["job_id"], "grid-abc123");
    }
}
