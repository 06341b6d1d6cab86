use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{OrchError, Result};

/// Aggregates a set of `metrics.json` artifacts into a single weighted
/// summary, and renders failure/AB-diff reports as CSV.
pub struct MetricsAggregator;

impl MetricsAggregator {
    fn resolve_sources(sources: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for item in sources {
            if item.is_dir() {
                let candidate = item.join("metrics.json");
                if candidate.exists() {
                    paths.push(candidate);
                }
            } else if item.is_file() {
                paths.push(item.clone());
            } else {
                return Err(OrchError::MetricsUnavailable {
                    msg: format!("metrics source not found: {}", item.display()),
                    hint: None,
                });
            }
        }
        if paths.is_empty() {
            return Err(OrchError::MetricsUnavailable {
                msg: "no metrics paths resolved from the provided sources".to_string(),
                hint: None,
            });
        }
        Ok(paths)
    }

    /// Count-weighted average of `recall_at_10`/`p95_ms`, summed `cost_per_query`.
    /// A job with `count <= 0` still contributes with weight 1, so a single
    /// malformed artifact can't zero out the whole aggregate.
    pub fn aggregate(sources: &[PathBuf]) -> Result<Value> {
        let paths = Self::resolve_sources(sources)?;

        let mut total_weight: i64 = 0;
        let mut weighted_recall = 0.0;
        let mut weighted_p95 = 0.0;
        let mut total_cost = 0.0;
        let mut total_count: i64 = 0;
        let mut jobs = Vec::new();
        let mut statuses = Vec::new();

        for path in &paths {
            let contents = std::fs::read_to_string(path)?;
            let data: Value = serde_json::from_str(&contents)?;
            let metrics = data.get("metrics").cloned().unwrap_or(Value::Null);

            let job_id = data
                .get("job_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    path.parent()
                        .and_then(|p| p.file_name())
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default()
                });
            let status = data.get("status").and_then(Value::as_str).unwrap_or("unknown").to_string();
            jobs.push(job_id);
            statuses.push(status);

            let count = metrics.get("count").and_then(Value::as_i64).unwrap_or(0);
            let weight = if count > 0 { count } else { 1 };
            let recall = metrics.get("recall_at_10").and_then(Value::as_f64).unwrap_or(0.0);
            let p95 = metrics.get("p95_ms").and_then(Value::as_f64).unwrap_or(0.0);
            let cost_per_query = metrics.get("cost_per_query").and_then(Value::as_f64).unwrap_or(0.0);

            total_weight += weight;
            weighted_recall += recall * weight as f64;
            weighted_p95 += p95 * weight as f64;
            total_cost += cost_per_query * weight as f64;
            total_count += count;
        }

        Ok(serde_json::json!({
            "jobs": jobs,
            "statuses": statuses,
            "count": total_count,
            "recall_at_10": if total_weight > 0 { weighted_recall / total_weight as f64 } else { 0.0 },
            "p95_ms": if total_weight > 0 { weighted_p95 / total_weight as f64 } else { 0.0 },
            "cost": total_cost,
        }))
    }

    /// Writes a `reason,count` CSV of the top-N most common non-`ok` statuses.
    pub fn write_fail_topn_csv(results: &[Value], output_path: &Path, top_n: usize) -> Result<()> {
        let mut counts: HashMap<String, u64> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for item in results {
            let status = item.get("status").and_then(Value::as_str).unwrap_or("").to_lowercase();
            if status == "ok" {
                continue;
            }
            let reason = item
                .get("error")
                .and_then(Value::as_str)
                .or_else(|| item.get("status").and_then(Value::as_str))
                .unwrap_or("unknown")
                .to_string();
            if !counts.contains_key(&reason) {
                order.push(reason.clone());
            }
            *counts.entry(reason).or_insert(0) += 1;
        }

        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut ranked: Vec<(String, u64)> = order.into_iter().map(|r| (r.clone(), counts[&r])).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));

        let mut csv = String::from("reason,count\n");
        for (reason, count) in ranked.into_iter().take(top_n) {
            csv.push_str(&format!("{},{count}\n", csv_escape(&reason)));
        }
        std::fs::write(output_path, csv)?;
        Ok(())
    }
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn aggregate_weights_by_count() {
        let dir = tempfile::tempdir().unwrap();
        let job_a = dir.path().join("a");
        let job_b = dir.path().join("b");
        std::fs::create_dir_all(&job_a).unwrap();
        std::fs::create_dir_all(&job_b).unwrap();
        std::fs::write(
            job_a.join("metrics.json"),
            json!({"job_id": "a", "status": "ok", "metrics": {"recall_at_10": 0.8, "p95_ms": 100.0, "cost_per_query": 0.01, "count": 100}}).to_string(),
        )
        .unwrap();
        std::fs::write(
            job_b.join("metrics.json"),
            json!({"job_id": "b", "status": "ok", "metrics": {"recall_at_10": 0.4, "p95_ms": 200.0, "cost_per_query": 0.02, "count": 300}}).to_string(),
        )
        .unwrap();

        let summary = MetricsAggregator::aggregate(&[job_a, job_b]).unwrap();
        let recall = summary["recall_at_10"].as_f64().unwrap();
        assert!((recall - 0.5).abs() < 1e-9);
    }

    #[test]
    fn aggregate_errors_on_empty_sources() {
        assert!(MetricsAggregator::aggregate(&[]).is_err());
    }

    #[test]
    fn fail_topn_skips_ok_and_ranks_by_frequency() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("fail.csv");
        let results = vec![
            json!({"status": "ok"}),
            json!({"status": "error", "error": "timeout"}),
            json!({"status": "error", "error": "timeout"}),
            json!({"status": "error", "error": "connection_refused"}),
        ];
        MetricsAggregator::write_fail_topn_csv(&results, &out, 5).unwrap();
        let contents = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "reason,count");
        assert_eq!(lines[1], "timeout,2");
        assert_eq!(lines[2], "connection_refused,1");
    }
}
