use std::collections::HashMap;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::{OrchestratorConfig, StageSection};
use crate::error::{OrchError, Result};
use crate::types::utc_timestamp;

/// Outcome of a single runner invocation, mirroring the shape written into
/// `metrics.json` by the actual evaluation runner.
#[derive(Debug, Clone)]
pub struct RunEvalResult {
    pub job_id: String,
    pub metrics_path: std::path::PathBuf,
    pub summary: Value,
}

/// Token-bucket-by-min-interval limiter, one per job prefix. Blocks the
/// calling thread until the minimum interval since the previous acquire has
/// elapsed.
struct RateLimiter {
    min_interval: Duration,
    last_at: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(rate_per_sec: f64) -> Self {
        let min_interval = if rate_per_sec > 0.0 {
            Duration::from_secs_f64(1.0 / rate_per_sec)
        } else {
            Duration::ZERO
        };
        RateLimiter {
            min_interval,
            last_at: Mutex::new(None),
        }
    }

    fn acquire(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut last_at = self.last_at.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if let Some(prev) = *last_at {
            let elapsed = now.duration_since(prev);
            if elapsed < self.min_interval {
                thread::sleep(self.min_interval - elapsed);
            }
        }
        *last_at = Some(Instant::now());
    }
}

/// Bounded concurrency gate shared by every job prefix at a given limit.
struct Semaphore {
    count: Mutex<usize>,
    limit: usize,
}

impl Semaphore {
    fn new(limit: usize) -> Self {
        Semaphore {
            count: Mutex::new(0),
            limit: limit.max(1),
        }
    }

    fn acquire(&self) {
        loop {
            {
                let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
                if *count < self.limit {
                    *count += 1;
                    return;
                }
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn release(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count = count.saturating_sub(1);
    }
}

/// Adapter around the external evaluation runner: host allow-listing, health
/// probing, rate limiting, bounded concurrency, retry/backoff, and timeout
/// classification on top of `std::process::Command`.
pub struct RunnerAdapter {
    config: OrchestratorConfig,
    rate_limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
    semaphores: Mutex<HashMap<usize, Arc<Semaphore>>>,
    job_counter: AtomicU64,
}

impl RunnerAdapter {
    pub fn new(config: OrchestratorConfig) -> Self {
        RunnerAdapter {
            config,
            rate_limiters: Mutex::new(HashMap::new()),
            semaphores: Mutex::new(HashMap::new()),
            job_counter: AtomicU64::new(0),
        }
    }

    fn rate_limiter(&self, key: &str, rate_per_sec: f64) -> Arc<RateLimiter> {
        let mut guard = self.rate_limiters.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::new(rate_per_sec)))
            .clone()
    }

    fn semaphore(&self, limit: usize) -> Arc<Semaphore> {
        let limit = limit.max(1);
        let mut guard = self.semaphores.lock().unwrap_or_else(|e| e.into_inner());
        guard.entry(limit).or_insert_with(|| Arc::new(Semaphore::new(limit))).clone()
    }

    fn create_job_id(&self, prefix: &str) -> String {
        self.job_counter.fetch_add(1, Ordering::Relaxed);
        let suffix = &Uuid::new_v4().simple().to_string()[..12];
        format!("{prefix}-{suffix}")
    }

    fn effective_base_url(&self) -> String {
        let base_url = &self.config.base_url;
        if base_url.is_empty() {
            return String::new();
        }
        let Ok(url) = url_host(base_url) else {
            return base_url.clone();
        };
        match self.config.host_aliases.get(&url) {
            Some(alias) => base_url.replacen(&url, alias, 1),
            None => base_url.clone(),
        }
    }

    fn validate_host(&self, url: &str) -> Result<()> {
        let host = url_host(url).map_err(|_| OrchError::SecurityBlock {
            msg: format!("invalid base url: {url}"),
            hint: None,
        })?;
        let allowed: std::collections::HashSet<String> =
            self.config.allowed_hosts.iter().map(|h| h.to_lowercase()).collect();
        if !allowed.contains(&host) {
            let mut sorted: Vec<&String> = self.config.allowed_hosts.iter().collect();
            sorted.sort();
            return Err(OrchError::SecurityBlock {
                msg: format!("host `{host}` not in allowed list: {sorted:?}"),
                hint: Some("add the backend host to allowed_hosts".to_string()),
            });
        }
        Ok(())
    }

    /// GETs every configured health endpoint against the effective base URL.
    /// Any non-2xx response or transport failure is a `HealthCheck` error.
    pub fn check_backend_health(&self) -> Result<()> {
        let base_url = self.config.base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(OrchError::HealthCheck {
                msg: "base_url is not configured".to_string(),
                hint: Some("set base_url in the orchestrator config".to_string()),
                details: None,
            });
        }
        let effective = self.effective_base_url();
        let root = if effective.is_empty() { base_url.clone() } else { effective.trim_end_matches('/').to_string() };

        for endpoint in &self.config.health_endpoints {
            if endpoint.is_empty() {
                continue;
            }
            let url = format!("{root}/{}", endpoint.trim_start_matches('/'));
            let started = Instant::now();
            let agent = ureq::AgentBuilder::new()
                .timeout(Duration::from_secs_f64(self.config.health_timeout_s))
                .build();
            match agent.get(&url).call() {
                Ok(response) if response.status() < 400 => {}
                Ok(response) => {
                    return Err(OrchError::HealthCheck {
                        msg: format!("health check {url} returned status {}", response.status()),
                        hint: Some("check service logs and health endpoint response".to_string()),
                        details: Some(json!({
                            "url": url,
                            "status_code": response.status(),
                            "elapsed_ms": started.elapsed().as_millis() as u64,
                        })),
                    });
                }
                Err(err) => {
                    return Err(OrchError::HealthCheck {
                        msg: format!("health check request to {url} failed: {err}"),
                        hint: Some("confirm the backend API is running and reachable".to_string()),
                        details: Some(json!({
                            "url": url,
                            "timeout_s": self.config.health_timeout_s,
                            "original_base": base_url,
                            "error": err.to_string(),
                        })),
                    });
                }
            }
        }
        Ok(())
    }

    fn build_runner_command(&self, dataset: &str, parameters: &Value) -> Result<Vec<String>> {
        let mut cmd = shlex::split(&self.config.runner_cmd)
            .ok_or_else(|| OrchError::plan_invalid(format!("cannot parse runner_cmd: {}", self.config.runner_cmd)))?;
        if cmd.is_empty() {
            return Err(OrchError::plan_invalid("runner_cmd is empty"));
        }
        let base = self.effective_base_url();
        let base = if base.is_empty() { self.config.base_url.clone() } else { base };
        cmd.push("--base".into());
        cmd.push(base);
        cmd.push("--collection".into());
        cmd.push(dataset.to_string());
        cmd.push("--sample".into());
        cmd.push(parameters["sample"].to_string());
        cmd.push("--top_k".into());
        cmd.push(parameters["top_k"].to_string());
        cmd.push("--concurrency".into());
        cmd.push(parameters["concurrency"].to_string());

        if let Some(qrels) = self.config.datasets.qrels_map.get(dataset) {
            cmd.push("--qrels".into());
            cmd.push(qrels.clone());
        }
        if let Some(queries) = self.config.datasets.queries_map.get(dataset) {
            cmd.push("--queries".into());
            cmd.push(queries.clone());
        }
        if let Some(ef) = parameters.get("ef_search").filter(|v| !v.is_null()) {
            cmd.push("--ef-search".into());
            cmd.push(ef.to_string());
        }
        if parameters.get("mmr").and_then(Value::as_bool).unwrap_or(false) {
            cmd.push("--mmr".into());
            cmd.push("--mmr-lambda".into());
            cmd.push(parameters.get("mmr_lambda").cloned().unwrap_or(json!(0.3)).to_string());
        }
        Ok(cmd)
    }

    fn mock_run(&self, parameters: &Value, job_prefix: &str) -> Result<RunEvalResult> {
        let runs_dir = &self.config.runs_dir;
        let job_id = self.create_job_id(&format!("{job_prefix}-mock"));
        let metrics_path = runs_dir.join(&job_id).join("metrics.json");
        std::fs::create_dir_all(metrics_path.parent().expect("metrics_path has a parent"))?;

        let top_k = parameters.get("top_k").and_then(Value::as_i64).unwrap_or(10);
        let sample = parameters.get("sample").and_then(Value::as_i64).unwrap_or(50);
        let recall = (0.4 + 0.02 * top_k as f64).min(0.99);
        let p95_ms = 80.0 + 3.0 * top_k as f64;
        let cost = 0.001 * top_k as f64;

        let payload = json!({
            "job_id": job_id,
            "status": "ok",
            "metrics": {
                "recall_at_10": recall,
                "p95_ms": p95_ms,
                "cost_per_query": cost,
                "count": sample,
            },
            "latency_breakdown_ms": {"search": p95_ms / 2.0},
            "config": parameters,
        });
        std::fs::write(&metrics_path, serde_json::to_string_pretty(&payload)?)?;

        Ok(RunEvalResult {
            job_id,
            metrics_path,
            summary: json!({
                "job_id": payload["job_id"],
                "status": "ok",
                "metrics": payload["metrics"],
                "latency_breakdown_ms": payload["latency_breakdown_ms"],
            }),
        })
    }

    fn wait_with_timeout(mut child: Child, timeout: Duration) -> Result<std::process::ExitStatus> {
        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if start.elapsed() >= timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(OrchError::RunnerTimeout {
                    msg: format!("runner timed out after {}s", timeout.as_secs_f64()),
                    hint: Some("check backend runner status or raise runner_timeout_s".to_string()),
                    details: None,
                });
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    fn execute_runner(
        &self,
        command: &[String],
        job_prefix: &str,
        max_retries: u32,
        backoff_s: f64,
        rate_per_sec: f64,
        concurrency_limit: usize,
        runner_timeout: Duration,
    ) -> Result<RunEvalResult> {
        let base_url = &self.config.base_url;
        self.validate_host(base_url)?;
        let effective = self.effective_base_url();
        if !effective.is_empty() && effective != *base_url {
            self.validate_host(&effective)?;
        }

        std::fs::create_dir_all(&self.config.runs_dir)?;
        let job_id = self.create_job_id(job_prefix);
        let metrics_path = self.config.runs_dir.join(&job_id).join("metrics.json");

        let limiter = self.rate_limiter(job_prefix, rate_per_sec);
        let semaphore = self.semaphore(concurrency_limit);

        let mut attempt = 0u32;
        let command_summary = command.iter().take(8).cloned().collect::<Vec<_>>().join(" ");
        loop {
            semaphore.acquire();
            limiter.acquire();
            let result = (|| -> Result<RunEvalResult> {
                tracing::info!(job_prefix, job_id, attempt, "starting runner invocation");
                let mut cmd = Command::new(&command[0]);
                cmd.args(&command[1..])
                    .env("RUNS_DIR", &self.config.runs_dir)
                    .env("JOB_ID", &job_id)
                    .env("BASE", if effective.is_empty() { base_url.clone() } else { effective.clone() })
                    .stdin(Stdio::null())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
                let child = cmd.spawn().map_err(|err| {
                    if err.kind() == std::io::ErrorKind::NotFound {
                        OrchError::RunnerFailed {
                            msg: "runner executable not found".to_string(),
                            hint: Some("confirm runner_cmd points at an executable".to_string()),
                            details: Some(json!({"command": command_summary})),
                        }
                    } else {
                        OrchError::Io(err)
                    }
                })?;
                let status = Self::wait_with_timeout(child, runner_timeout)?;
                if !status.success() {
                    return Err(OrchError::RunnerFailed {
                        msg: format!("{job_prefix} evaluation exited with {status}"),
                        hint: Some("inspect runner stdout/stderr and backend logs".to_string()),
                        details: Some(json!({"command": command_summary, "exit_code": status.code()})),
                    });
                }
                let contents = std::fs::read_to_string(&metrics_path).map_err(|_| OrchError::RunnerFailed {
                    msg: format!("metrics.json not found at {}", metrics_path.display()),
                    hint: None,
                    details: Some(json!({"command": command_summary})),
                })?;
                let data: Value = serde_json::from_str(&contents)?;
                let summary = json!({
                    "job_id": data.get("job_id").cloned().unwrap_or(json!(job_id)),
                    "status": data.get("status").cloned().unwrap_or(json!("unknown")),
                    "metrics": data.get("metrics").cloned().unwrap_or(json!({})),
                    "latency_breakdown_ms": data.get("latency_breakdown_ms").cloned().unwrap_or(json!({})),
                });
                Ok(RunEvalResult {
                    job_id: summary["job_id"].as_str().unwrap_or(&job_id).to_string(),
                    metrics_path: metrics_path.clone(),
                    summary,
                })
            })();
            semaphore.release();

            match result {
                Ok(r) => return Ok(r),
                Err(err) => {
                    attempt += 1;
                    if attempt >= max_retries {
                        return Err(err);
                    }
                    tracing::warn!(job_prefix, attempt, max_retries, %err, "runner attempt failed, retrying");
                    thread::sleep(Duration::from_secs_f64(backoff_s * 2f64.powi(attempt as i32 - 1)));
                }
            }
        }
    }

    /// `grid` has no dedicated timeout/retry knobs of its own (`GridSection`
    /// only carries sample/concurrency/seed); it always defers to `smoke`'s,
    /// matching the source's fallback-to-smoke-config behavior.
    fn section_for(&self, section: &str) -> &StageSection {
        match section {
            "ab" => &self.config.ab,
            _ => &self.config.smoke,
        }
    }

    fn run_parameterized_job(&self, parameters: Value, job_prefix: &str, section: &str) -> Result<RunEvalResult> {
        let dataset = parameters["dataset"]
            .as_str()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| OrchError::plan_invalid(format!("{job_prefix} evaluation requires a dataset name")))?
            .to_string();

        let section_cfg = self.section_for(section);
        let fallback_cfg = &self.config.smoke;

        let timeout_s = if section_cfg.timeout_s > 0.0 { section_cfg.timeout_s } else { fallback_cfg.timeout_s };
        let max_retries = section_cfg.max_retries.max(1);
        let backoff_s = section_cfg.backoff_s;
        let rate_per_sec = section_cfg.rate_limit_per_sec;
        let concurrency = parameters.get("concurrency").and_then(Value::as_u64).unwrap_or(1) as usize;

        if self.config.mock_runner {
            return self.mock_run(&parameters, job_prefix);
        }
        self.check_backend_health()?;

        let command = self.build_runner_command(&dataset, &parameters)?;
        let runner_timeout_s = if self.config.runner_timeout_s > 0.0 { self.config.runner_timeout_s } else { timeout_s };
        let runner_timeout = Duration::from_secs_f64(runner_timeout_s);
        self.execute_runner(&command, job_prefix, max_retries, backoff_s, rate_per_sec, concurrency.max(1), runner_timeout)
    }

    pub fn run_smoke(&self, dataset: &str, sample_size: u64) -> Result<RunEvalResult> {
        let smoke = &self.config.smoke;
        let parameters = json!({
            "dataset": dataset,
            "sample": smoke.sample.unwrap_or(sample_size),
            "top_k": smoke.top_k.unwrap_or(10),
            "mmr": smoke.mmr.clone().unwrap_or(json!(false)),
            "mmr_lambda": 0.3,
            "concurrency": smoke.concurrency.unwrap_or(4),
            "created_at": utc_timestamp(),
        });
        self.run_parameterized_job(parameters, "smoke", "smoke")
    }

    pub fn run_grid_task(&self, parameters: Value) -> Result<RunEvalResult> {
        if parameters.get("ef_search").is_none_or(Value::is_null) {
            return Err(OrchError::plan_invalid("grid task requires ef_search parameter"));
        }
        self.run_parameterized_job(parameters, "grid", "grid")
    }

    pub fn run_ab_task(&self, parameters: Value) -> Result<RunEvalResult> {
        self.run_parameterized_job(parameters, "ab", "ab")
    }
}

fn url_host(url: &str) -> std::result::Result<String, ()> {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    let host = without_scheme.split('/').next().unwrap_or(without_scheme);
    if host.is_empty() {
        Err(())
    } else {
        Ok(host.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_host_extracts_netloc_with_port() {
        assert_eq!(url_host("https://api.internal:8080/v1").unwrap(), "api.internal:8080");
    }

    #[test]
    fn url_host_rejects_empty() {
        assert!(url_host("").is_err());
    }

    #[test]
    fn rate_limiter_zero_rate_never_blocks() {
        let limiter = RateLimiter::new(0.0);
        let start = Instant::now();
        limiter.acquire();
        limiter.acquire();
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn mock_run_produces_metrics_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::default();
        config.runs_dir = dir.path().to_path_buf();
        config.mock_runner = true;
        let adapter = RunnerAdapter::new(config);
        let result = adapter.run_smoke("fiqa", 50).unwrap();
        assert!(result.metrics_path.exists());
        assert!(result.summary["metrics"]["recall_at_10"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn validate_host_rejects_unlisted_host() {
        let mut config = OrchestratorConfig::default();
        config.base_url = "https://evil.example/".to_string();
        config.allowed_hosts = vec!["api.internal".to_string()];
        let adapter = RunnerAdapter::new(config);
        let err = adapter.validate_host("https://evil.example/").unwrap_err();
        assert_eq!(err.kind(), "SecurityBlock");
    }
}
