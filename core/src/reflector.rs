use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use regex_lite::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::LlmSection;
use crate::event_log::EventLogger;
use crate::types::{NextAction, ReflectionDecision, ReflectionResult, PIPELINE_STAGES};

fn compute_failure_rate(results: &[Value]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    let failures = results.iter().filter(|r| r.get("status").and_then(Value::as_str) != Some("ok")).count();
    failures as f64 / results.len() as f64
}

fn compute_recall_variance(results: &[Value]) -> f64 {
    let recalls: Vec<f64> = results
        .iter()
        .filter_map(|r| r.get("metrics").and_then(|m| m.get("recall_at_10")).and_then(Value::as_f64))
        .collect();
    if recalls.len() < 2 {
        return 0.0;
    }
    let mean = recalls.iter().sum::<f64>() / recalls.len() as f64;
    recalls.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / recalls.len() as f64
}

/// Decides whether a stage should keep going, shrink its search space, or
/// stop early, based on the failure rate and recall variance of its results.
pub fn post_phase_reflect(
    run_id: &str,
    stage: &str,
    results: &[Value],
    failure_threshold: f64,
    variance_threshold: f64,
    logger: Option<&EventLogger>,
) -> ReflectionDecision {
    let stage_upper = stage.to_uppercase();
    let failure_rate = compute_failure_rate(results);
    let recall_variance = compute_recall_variance(results);

    let decision = if failure_rate >= failure_threshold {
        ReflectionDecision {
            action: "early_stop".to_string(),
            reason: format!("failure_rate {:.1}% exceeds threshold {:.0}%", failure_rate * 100.0, failure_threshold * 100.0),
        }
    } else if recall_variance >= variance_threshold {
        ReflectionDecision {
            action: "shrink".to_string(),
            reason: format!("recall variance {recall_variance:.4} exceeds threshold {variance_threshold:.4}"),
        }
    } else {
        ReflectionDecision {
            action: "keep".to_string(),
            reason: "metrics stable".to_string(),
        }
    };

    if let Some(logger) = logger {
        let _ = logger.log_event(
            run_id,
            "REFLECTION_DECISION",
            json!({
                "stage": stage_upper,
                "action": decision.action,
                "reason": decision.reason,
                "failure_rate": failure_rate,
                "recall_variance": recall_variance,
            }),
        );
    }

    decision
}

struct MaskPattern {
    regex: Regex,
    replacement: &'static str,
}

fn mask_patterns() -> Vec<MaskPattern> {
    vec![
        MaskPattern { regex: Regex::new(r"/\S+").unwrap(), replacement: "[PATH]" },
        MaskPattern { regex: Regex::new(r"https?://\S+").unwrap(), replacement: "[URL]" },
        MaskPattern { regex: Regex::new(r"sk-[a-zA-Z0-9]{32,}").unwrap(), replacement: "[API_KEY]" },
        MaskPattern { regex: Regex::new(r"[a-zA-Z0-9]{32,}").unwrap(), replacement: "[HASH]" },
        MaskPattern { regex: Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").unwrap(), replacement: "[IP]" },
    ]
}

/// Masks paths/URLs/keys/hashes/IPs, in that order, then truncates. Order
/// matters: URL masking must run before the generic hash pattern would eat
/// the path segment of a URL.
pub fn sanitize_and_shorten(text: &str, max_chars: usize) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut sanitized = text.to_string();
    for pattern in mask_patterns() {
        sanitized = pattern.regex.replace_all(&sanitized, pattern.replacement).into_owned();
    }
    if sanitized.chars().count() > max_chars {
        let truncated: String = sanitized.chars().take(max_chars).collect();
        format!("{truncated}...")
    } else {
        sanitized
    }
}

/// Append-only JSONL cache of LLM reflection results, keyed by prompt hash.
pub struct ReflectionCache {
    storage_path: PathBuf,
    cache: Mutex<HashMap<String, Value>>,
}

impl ReflectionCache {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        let storage_path = storage_path.into();
        let cache = Mutex::new(Self::load(&storage_path));
        ReflectionCache { storage_path, cache }
    }

    fn load(path: &Path) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        let Ok(contents) = std::fs::read_to_string(path) else {
            return map;
        };
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(entry) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            if let Some(hash) = entry.get("prompt_hash").and_then(Value::as_str) {
                map.insert(hash.to_string(), entry.get("payload").cloned().unwrap_or(Value::Null));
            }
        }
        map
    }

    pub fn get(&self, prompt_hash: &str) -> Option<Value> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(prompt_hash).cloned()
    }

    pub fn set(&self, prompt_hash: &str, payload: Value) {
        let mut guard = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(prompt_hash.to_string(), payload.clone());
        if let Some(parent) = self.storage_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(&self.storage_path) {
            let entry = json!({"prompt_hash": prompt_hash, "payload": payload});
            let _ = writeln!(file, "{entry}");
        }
    }
}

fn estimate_eta_min(stage: &str) -> u32 {
    match stage {
        "SMOKE" => 2,
        "GRID" => 10,
        "AB" => 5,
        "SELECT" => 1,
        "PUBLISH" => 2,
        _ => 5,
    }
}

fn rule_based_summary(stage: &str, kpis: &Value, sla: &Value) -> String {
    let mut lines = vec![format!("# Stage: {stage}"), String::new()];

    let metrics = kpis.get("metrics").cloned().unwrap_or(Value::Null);
    if metrics.is_object() {
        lines.push("## Metrics".to_string());
        if let Some(v) = metrics.get("recall_at_10").and_then(Value::as_f64) {
            lines.push(format!("- Recall@10: {v:.4}"));
        }
        if let Some(v) = metrics.get("p95_ms").and_then(Value::as_f64) {
            lines.push(format!("- P95 Latency: {v:.2} ms"));
        }
        if let Some(v) = metrics.get("cost").and_then(Value::as_f64) {
            lines.push(format!("- Cost: {v:.4}"));
        }
        lines.push(String::new());
    }

    let verdict = sla.get("verdict").and_then(Value::as_str).unwrap_or("unknown");
    lines.push(format!("## SLA Status: {}", verdict.to_uppercase()));
    if let Some(checks) = sla.get("checks").and_then(Value::as_array) {
        for check in checks {
            let status = check.get("status").and_then(Value::as_str).unwrap_or("unknown");
            let mark = if status == "pass" { "✓" } else { "✗" };
            let metric = check.get("metric").and_then(Value::as_str).unwrap_or("unknown");
            let value = check.get("value").and_then(Value::as_f64).unwrap_or(0.0);
            let threshold = check.get("threshold").and_then(Value::as_f64).unwrap_or(0.0);
            lines.push(format!("- {mark} {metric} ({status}): value={value:.4} threshold={threshold:.4}"));
        }
    }
    lines.push(String::new());

    if let Some(duration_ms) = kpis.get("duration_ms").and_then(Value::as_u64) {
        if duration_ms > 0 {
            lines.push(format!("## Duration: {duration_ms} ms"));
        }
    }

    lines.join("\n")
}

fn rule_based_next_actions(stage: &str, sla: &Value) -> Vec<NextAction> {
    let mut actions = Vec::new();
    if let Some(idx) = PIPELINE_STAGES.iter().position(|s| *s == stage) {
        if idx + 1 < PIPELINE_STAGES.len() {
            let next_stage = PIPELINE_STAGES[idx + 1];
            actions.push(NextAction {
                id: format!("proceed_to_{}", next_stage.to_lowercase()),
                label: format!("Proceed to {next_stage}"),
                eta_min: estimate_eta_min(next_stage),
            });
        }
    }
    if sla.get("verdict").and_then(Value::as_str) == Some("fail") {
        actions.push(NextAction {
            id: "review_sla_violations".to_string(),
            label: "Review SLA violations".to_string(),
            eta_min: 5,
        });
    }
    actions
}

fn compute_prompt_hash(stage: &str, kpis: &Value, sla: &Value) -> String {
    let data = json!({
        "stage": stage,
        "metrics": kpis.get("metrics").cloned().unwrap_or(json!({})),
        "sla_verdict": sla.get("verdict").cloned().unwrap_or(json!("unknown")),
    });
    let mut hasher = Sha256::new();
    hasher.update(data.to_string().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect::<String>()[..16].to_string()
}

/// Calls an OpenAI-compatible chat completions endpoint over HTTP, parsing
/// the response as `{rationale_md, next_actions}`. Any failure (network,
/// missing key, bad JSON) is treated as a recoverable condition by the
/// caller, which falls back to the rule-based summary.
fn llm_summarize(stage: &str, kpis: &Value, sla: &Value, llm_cfg: &LlmSection) -> anyhow::Result<Value> {
    let api_key_env = llm_cfg.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY");
    let api_key = std::env::var(api_key_env).map_err(|_| anyhow::anyhow!("{api_key_env} environment variable not set"))?;
    let base_url = llm_cfg.base_url.as_deref().unwrap_or("https://api.openai.com/v1");
    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));

    let system_prompt = "You are an expert ML engineer analyzing experiment stage results. \
        Return a JSON object with 'rationale_md' (markdown summary) and 'next_actions' (array of {id, label, eta_min}). \
        Be concise and actionable.";
    let user_prompt = format!(
        "Analyze the {stage} stage results:\n\nMetrics: {}\nDuration: {} ms\nSLA Verdict: {}\n",
        kpis.get("metrics").cloned().unwrap_or(json!({})),
        kpis.get("duration_ms").and_then(Value::as_u64).unwrap_or(0),
        sla.get("verdict").and_then(Value::as_str).unwrap_or("unknown"),
    );

    let body = json!({
        "model": llm_cfg.model,
        "messages": [
            {"role": "system", "content": system_prompt},
            {"role": "user", "content": user_prompt},
        ],
        "temperature": llm_cfg.temperature,
        "max_tokens": llm_cfg.max_tokens,
        "response_format": {"type": "json_object"},
    });

    let response: Value = ureq::post(&url)
        .set("Authorization", &format!("Bearer {api_key}"))
        .send_json(body)?
        .into_json()?;

    let content = response["choices"][0]["message"]["content"].as_str().unwrap_or("{}");
    let llm_data: Value = serde_json::from_str(content)?;

    let prompt_tokens = response["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
    let completion_tokens = response["usage"]["completion_tokens"].as_u64().unwrap_or(0);
    let total_tokens = response["usage"]["total_tokens"].as_u64().unwrap_or(prompt_tokens + completion_tokens);
    let cost_usd = (prompt_tokens as f64 * 0.15 + completion_tokens as f64 * 0.60) / 1_000_000.0;

    let next_actions: Vec<Value> = llm_data
        .get("next_actions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter(|a| a.get("id").is_some() && a.get("label").is_some())
        .map(|a| {
            json!({
                "id": a["id"].as_str().unwrap_or_default(),
                "label": a["label"].as_str().unwrap_or_default(),
                "eta_min": a.get("eta_min").and_then(Value::as_u64).unwrap_or(5),
            })
        })
        .collect();

    Ok(json!({
        "model": llm_cfg.model,
        "tokens": total_tokens,
        "cost_usd": cost_usd,
        "confidence": 0.8,
        "rationale_md": llm_data.get("rationale_md").and_then(Value::as_str).unwrap_or(""),
        "next_actions": next_actions,
    }))
}

/// Post-stage narrative summary, either rule-based or (when enabled, within
/// budget, and not cached) LLM-generated. Always succeeds: any LLM failure
/// silently falls back to the rule-based path.
pub fn summarize(stage: &str, kpis: &Value, sla: &Value, llm_cfg: &LlmSection, cache: &ReflectionCache, spent_cost: f64) -> ReflectionResult {
    let start = Instant::now();
    let stage_upper = stage.to_uppercase();

    let fallback = |blocked: bool| -> ReflectionResult {
        let rationale_md = rule_based_summary(&stage_upper, kpis, sla);
        ReflectionResult {
            stage: stage_upper.clone(),
            model: "rule-engine".to_string(),
            tokens: 0,
            cost_usd: 0.0,
            confidence: 0.5,
            cache_hit: false,
            blocked,
            elapsed_ms: start.elapsed().as_millis() as u64,
            prompt_hash: String::new(),
            rationale_md_lite: sanitize_and_shorten(&rationale_md, 1200),
            rationale_md,
            next_actions: rule_based_next_actions(&stage_upper, sla),
        }
    };

    if !llm_cfg.enable || llm_cfg.cost_cap_usd <= spent_cost {
        return fallback(true);
    }

    let prompt_hash = compute_prompt_hash(&stage_upper, kpis, sla);

    if let Some(cached) = cache.get(&prompt_hash) {
        let rationale_md = cached.get("rationale_md").and_then(Value::as_str).unwrap_or("").to_string();
        return ReflectionResult {
            stage: stage_upper,
            model: cached.get("model").and_then(Value::as_str).unwrap_or("rule-engine").to_string(),
            tokens: 0,
            cost_usd: 0.0,
            confidence: cached.get("confidence").and_then(Value::as_f64).unwrap_or(0.5),
            cache_hit: true,
            blocked: false,
            elapsed_ms: start.elapsed().as_millis() as u64,
            prompt_hash,
            rationale_md_lite: sanitize_and_shorten(&rationale_md, 1200),
            rationale_md,
            next_actions: cached
                .get("next_actions")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter_map(|a| serde_json::from_value(a).ok())
                .collect(),
        };
    }

    match llm_summarize(&stage_upper, kpis, sla, llm_cfg) {
        Ok(llm_result) => {
            let estimated_cost = llm_result.get("cost_usd").and_then(Value::as_f64).unwrap_or(0.0);
            if spent_cost + estimated_cost > llm_cfg.cost_cap_usd {
                return fallback(true);
            }
            let rationale_md = llm_result.get("rationale_md").and_then(Value::as_str).unwrap_or("").to_string();
            let next_actions: Vec<NextAction> = llm_result
                .get("next_actions")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter_map(|a| serde_json::from_value(a).ok())
                .collect();
            cache.set(
                &prompt_hash,
                json!({
                    "model": llm_result["model"],
                    "tokens": llm_result["tokens"],
                    "cost_usd": llm_result["cost_usd"],
                    "confidence": llm_result["confidence"],
                    "rationale_md": rationale_md,
                    "next_actions": next_actions,
                }),
            );
            ReflectionResult {
                stage: stage_upper,
                model: llm_result.get("model").and_then(Value::as_str).unwrap_or("unknown").to_string(),
                tokens: llm_result.get("tokens").and_then(Value::as_u64).unwrap_or(0),
                cost_usd: estimated_cost,
                confidence: llm_result.get("confidence").and_then(Value::as_f64).unwrap_or(0.8),
                cache_hit: false,
                blocked: false,
                elapsed_ms: start.elapsed().as_millis() as u64,
                prompt_hash,
                rationale_md_lite: sanitize_and_shorten(&rationale_md, 1200),
                rationale_md,
                next_actions,
            }
        }
        Err(_) => fallback(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_masks_paths_and_urls() {
        let text = "see /var/log/app.log or https://example.com/secret?x=1";
        let out = sanitize_and_shorten(text, 1200);
        assert!(out.contains("[PATH]") || out.contains("[URL]"));
        assert!(!out.contains("/var/log"));
    }

    #[test]
    fn sanitize_truncates_long_text() {
        let text = "a".repeat(2000);
        let out = sanitize_and_shorten(&text, 100);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn reflect_early_stops_on_high_failure_rate() {
        let results = vec![json!({"status": "error"}), json!({"status": "error"}), json!({"status": "ok"})];
        let decision = post_phase_reflect("r1", "grid", &results, 0.3, 0.02, None);
        assert_eq!(decision.action, "early_stop");
    }

    #[test]
    fn reflect_keeps_when_stable() {
        let results = vec![json!({"status": "ok", "metrics": {"recall_at_10": 0.5}})];
        let decision = post_phase_reflect("r1", "grid", &results, 0.3, 0.02, None);
        assert_eq!(decision.action, "keep");
    }

    #[test]
    fn summarize_falls_back_when_llm_disabled() {
        let llm_cfg = LlmSection::default();
        let dir = tempfile::tempdir().unwrap();
        let cache = ReflectionCache::new(dir.path().join("cache.jsonl"));
        let result = summarize("smoke", &json!({"metrics": {"recall_at_10": 0.5}}), &json!({"verdict": "pass"}), &llm_cfg, &cache, 0.0);
        assert!(result.blocked);
        assert_eq!(result.model, "rule-engine");
    }
}
