use std::path::{Path, PathBuf};

use plotters::prelude::*;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::metrics::MetricsAggregator;
use crate::types::utc_timestamp;

fn plot_err<E: std::fmt::Display>(e: E) -> crate::error::OrchError {
    crate::error::OrchError::MetricsUnavailable {
        msg: format!("chart rendering failed: {e}"),
        hint: None,
    }
}

fn min_max(values: &[f64], default_min: f64, default_max: f64) -> (f64, f64) {
    if values.is_empty() {
        return (default_min, default_max);
    }
    let mut lo = values[0];
    let mut hi = values[0];
    for &v in values {
        lo = lo.min(v);
        hi = hi.max(v);
    }
    if (hi - lo).abs() < 1e-9 {
        hi = lo + 1.0;
    }
    (lo * 0.95, hi * 1.05)
}

/// Writes the artifacts a run leaves behind: per-run winner files, the
/// recall/latency Pareto chart, the AB comparison chart+CSV, and the
/// cross-run winners ledger.
pub struct ArtifactPublisher;

impl ArtifactPublisher {
    /// Keeps only the points where latency doesn't regress as recall drops.
    /// Sort is `(-recall_at_10, p95_ms)`, distinct from the 3-key ranking
    /// used to pick a single winner.
    pub fn pareto_front(rows: &[Value]) -> Vec<Value> {
        let mut sorted: Vec<Value> = rows.to_vec();
        sorted.sort_by(|a, b| {
            let ra = a["metrics"]["recall_at_10"].as_f64().unwrap_or(0.0);
            let rb = b["metrics"]["recall_at_10"].as_f64().unwrap_or(0.0);
            rb.partial_cmp(&ra)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let pa = a["metrics"]["p95_ms"].as_f64().unwrap_or(f64::MAX);
                    let pb = b["metrics"]["p95_ms"].as_f64().unwrap_or(f64::MAX);
                    pa.partial_cmp(&pb).unwrap_or(std::cmp::Ordering::Equal)
                })
        });

        let mut front = Vec::new();
        let mut running_min_latency = f64::INFINITY;
        for row in sorted {
            let latency = row["metrics"]["p95_ms"].as_f64().unwrap_or(f64::MAX);
            if latency <= running_min_latency {
                running_min_latency = latency;
                front.push(row);
            }
        }
        front
    }

    pub fn render_pareto_chart(rows: &[Value], output_path: &Path) -> Result<()> {
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let front = Self::pareto_front(rows);

        let recalls: Vec<f64> = rows.iter().filter_map(|r| r["metrics"]["recall_at_10"].as_f64()).collect();
        let latencies: Vec<f64> = rows.iter().filter_map(|r| r["metrics"]["p95_ms"].as_f64()).collect();
        let (r_min, r_max) = min_max(&recalls, 0.0, 1.0);
        let (l_min, l_max) = min_max(&latencies, 0.0, 1000.0);

        let root = BitMapBackend::new(output_path, (800, 600)).into_drawing_area();
        root.fill(&WHITE).map_err(plot_err)?;

        let mut chart = ChartBuilder::on(&root)
            .caption("Recall vs P95 Latency (Pareto Front)", ("sans-serif", 24))
            .margin(20)
            .x_label_area_size(40)
            .y_label_area_size(50)
            .build_cartesian_2d(r_min..r_max, l_min..l_max)
            .map_err(plot_err)?;
        chart.configure_mesh().x_desc("recall@10").y_desc("p95 (ms)").draw().map_err(plot_err)?;

        chart
            .draw_series(
                rows.iter()
                    .filter_map(|r| Some((r["metrics"]["recall_at_10"].as_f64()?, r["metrics"]["p95_ms"].as_f64()?)))
                    .map(|(x, y)| Circle::new((x, y), 4, BLUE.filled())),
            )
            .map_err(plot_err)?;

        let mut front_points: Vec<(f64, f64)> = front
            .iter()
            .filter_map(|r| Some((r["metrics"]["recall_at_10"].as_f64()?, r["metrics"]["p95_ms"].as_f64()?)))
            .collect();
        front_points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        if front_points.len() >= 2 {
            chart.draw_series(LineSeries::new(front_points, &RED)).map_err(plot_err)?;
        }

        root.present().map_err(plot_err)?;
        Ok(())
    }

    /// `baseline`/`challenger` are flat `{recall_at_10, p95_ms, cost}` maps,
    /// the same shape `MetricsAggregator::aggregate` returns.
    pub fn render_ab_chart(baseline: &Value, challenger: &Value, output_path: &Path) -> Result<()> {
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let metric_names = ["recall_at_10", "p95_ms", "cost"];
        let baseline_vals: Vec<f64> = metric_names.iter().map(|m| baseline.get(*m).and_then(Value::as_f64).unwrap_or(0.0)).collect();
        let challenger_vals: Vec<f64> = metric_names.iter().map(|m| challenger.get(*m).and_then(Value::as_f64).unwrap_or(0.0)).collect();
        let max_val = baseline_vals.iter().chain(challenger_vals.iter()).cloned().fold(0.0f64, f64::max).max(1.0);

        let root = BitMapBackend::new(output_path, (900, 500)).into_drawing_area();
        root.fill(&WHITE).map_err(plot_err)?;

        let mut chart = ChartBuilder::on(&root)
            .caption("Baseline vs Challenger", ("sans-serif", 24))
            .margin(20)
            .x_label_area_size(40)
            .y_label_area_size(50)
            .build_cartesian_2d(0f64..metric_names.len() as f64, 0f64..(max_val * 1.2))
            .map_err(plot_err)?;
        chart
            .configure_mesh()
            .x_labels(metric_names.len())
            .x_label_formatter(&|x| metric_names.get(x.round() as usize).copied().unwrap_or("").to_string())
            .y_desc("value")
            .draw()
            .map_err(plot_err)?;

        chart
            .draw_series(baseline_vals.iter().enumerate().map(|(i, &v)| {
                Rectangle::new([(i as f64 + 0.1, 0.0), (i as f64 + 0.4, v)], BLUE.filled())
            }))
            .map_err(plot_err)?
            .label("baseline")
            .legend(|(x, y)| Rectangle::new([(x, y - 5), (x + 10, y + 5)], BLUE.filled()));

        chart
            .draw_series(challenger_vals.iter().enumerate().map(|(i, &v)| {
                Rectangle::new([(i as f64 + 0.5, 0.0), (i as f64 + 0.9, v)], RED.filled())
            }))
            .map_err(plot_err)?
            .label("challenger")
            .legend(|(x, y)| Rectangle::new([(x, y - 5), (x + 10, y + 5)], RED.filled()));

        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .draw()
            .map_err(plot_err)?;
        root.present().map_err(plot_err)?;
        Ok(())
    }

    pub fn write_ab_diff_csv(baseline: &Value, challenger: &Value, output_path: &Path) -> Result<()> {
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut csv = String::from("metric,baseline,challenger,delta\n");
        for metric in ["recall_at_10", "p95_ms", "cost"] {
            let b = baseline.get(metric).and_then(Value::as_f64).unwrap_or(0.0);
            let c = challenger.get(metric).and_then(Value::as_f64).unwrap_or(0.0);
            csv.push_str(&format!("{metric},{b},{c},{}\n", c - b));
        }
        std::fs::write(output_path, csv)?;
        Ok(())
    }

    fn render_winner_markdown(winner: &Value) -> String {
        let config_id = winner.get("config_id").and_then(Value::as_str).unwrap_or("unknown");
        let mut lines = vec![format!("# Winner: {config_id}"), String::new(), "## Metrics".to_string()];
        if let Some(obj) = winner.get("metrics").and_then(Value::as_object) {
            for (k, v) in obj {
                lines.push(format!("- {k}: {v}"));
            }
        }
        lines.push(String::new());
        lines.push("## Parameters".to_string());
        if let Some(obj) = winner.get("parameters").and_then(Value::as_object) {
            for (k, v) in obj {
                lines.push(format!("- {k}: {v}"));
            }
        }
        lines.join("\n")
    }

    /// Full (not truncated) sha256 of `{config_id, parameters, metrics}`.
    /// `serde_json::Map` is BTreeMap-backed by default so this serialization
    /// is already key-sorted, matching `json.dumps(..., sort_keys=True)`.
    fn winner_hash(entry: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(entry.to_string().as_bytes());
        hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
    }

    fn resolve_ledger_path(winners_source: Option<&Path>, reports_dir: &Path) -> PathBuf {
        winners_source.map(Path::to_path_buf).unwrap_or_else(|| reports_dir.join("winners.final.json"))
    }

    /// Appends a deduplicated entry to the cross-run ledger. Preserves
    /// whatever shape the existing file has (an object keyed by hash, or an
    /// array of entries); a missing or unparsable file starts a fresh array.
    fn append_to_ledger(path: &Path, winner: &Value) -> Result<()> {
        let entry = json!({
            "config_id": winner.get("config_id").cloned().unwrap_or(Value::Null),
            "parameters": winner.get("parameters").cloned().unwrap_or(json!({})),
            "metrics": winner.get("metrics").cloned().unwrap_or(json!({})),
        });
        let hash = Self::winner_hash(&entry);

        let mut tagged = entry;
        if let Value::Object(ref mut map) = tagged {
            map.insert("hash".to_string(), json!(hash));
            map.insert("recorded_at".to_string(), json!(utc_timestamp()));
        }

        let existing = std::fs::read_to_string(path).ok().and_then(|s| serde_json::from_str::<Value>(&s).ok());

        let updated = match existing {
            Some(Value::Object(mut map)) => {
                map.entry(hash.clone()).or_insert(tagged);
                Value::Object(map)
            }
            Some(Value::Array(mut items)) => {
                let present = items.iter().any(|e| e.get("hash").and_then(Value::as_str) == Some(hash.as_str()));
                if !present {
                    items.push(tagged);
                }
                Value::Array(items)
            }
            _ => Value::Array(vec![tagged]),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&updated)?)?;
        Ok(())
    }

    /// Writes winners.json/winners.md/pareto.png/failTopN.csv for the run and
    /// appends to the cross-run winners ledger. Returns a map of artifact
    /// name to path, suitable for `PUBLISH_DONE`'s event payload.
    pub fn publish(reports_dir: &Path, run_id: &str, winner: &Value, grid_rows: &[Value], winners_source: Option<&Path>) -> Result<Value> {
        let run_dir = reports_dir.join(run_id);
        std::fs::create_dir_all(&run_dir)?;

        let winners_json_path = run_dir.join("winners.json");
        std::fs::write(&winners_json_path, serde_json::to_string_pretty(winner)?)?;

        let winners_md_path = run_dir.join("winners.md");
        std::fs::write(&winners_md_path, Self::render_winner_markdown(winner))?;

        let pareto_path = run_dir.join("pareto.png");
        Self::render_pareto_chart(grid_rows, &pareto_path)?;

        let fail_topn_path = run_dir.join("failTopN.csv");
        MetricsAggregator::write_fail_topn_csv(grid_rows, &fail_topn_path, 10)?;

        let ledger_path = Self::resolve_ledger_path(winners_source, reports_dir);
        Self::append_to_ledger(&ledger_path, winner)?;

        Ok(json!({
            "winners_json": winners_json_path.to_string_lossy(),
            "winners_md": winners_md_path.to_string_lossy(),
            "pareto_png": pareto_path.to_string_lossy(),
            "fail_topn_csv": fail_topn_path.to_string_lossy(),
            "winners_ledger": ledger_path.to_string_lossy(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(config_id: &str, recall: f64, p95: f64) -> Value {
        json!({"config_id": config_id, "status": "ok", "metrics": {"recall_at_10": recall, "p95_ms": p95, "cost": 0.01}, "parameters": {}})
    }

    #[test]
    fn pareto_front_keeps_non_dominated_points() {
        let rows = vec![row("a", 0.9, 300.0), row("b", 0.8, 200.0), row("c", 0.5, 400.0)];
        let front = ArtifactPublisher::pareto_front(&rows);
        let ids: Vec<&str> = front.iter().map(|r| r["config_id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn ledger_append_dedups_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winners.final.json");
        let winner = json!({"config_id": "fiqa-k10-ef32-nommr", "parameters": {"top_k": 10}, "metrics": {"recall_at_10": 0.8}});
        ArtifactPublisher::append_to_ledger(&path, &winner).unwrap();
        ArtifactPublisher::append_to_ledger(&path, &winner).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 1);
    }

    #[test]
    fn ledger_append_preserves_object_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winners.final.json");
        std::fs::write(&path, "{}").unwrap();
        let winner = json!({"config_id": "x", "parameters": {}, "metrics": {}});
        ArtifactPublisher::append_to_ledger(&path, &winner).unwrap();
        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(parsed.is_object());
        assert_eq!(parsed.as_object().unwrap().len(), 1);
    }

    #[test]
    fn publish_writes_expected_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let winner = json!({"config_id": "fiqa-k10-ef32-nommr", "parameters": {"top_k": 10}, "metrics": {"recall_at_10": 0.8, "p95_ms": 120.0, "cost": 0.02}});
        let grid_rows = vec![row("fiqa-k10-ef32-nommr", 0.8, 120.0), row("fiqa-k20-ef32-nommr", 0.6, 90.0)];
        let artifacts = ArtifactPublisher::publish(dir.path(), "run-1", &winner, &grid_rows, None).unwrap();
        assert!(std::path::Path::new(artifacts["winners_json"].as_str().unwrap()).exists());
        assert!(std::path::Path::new(artifacts["pareto_png"].as_str().unwrap()).exists());
    }
}
