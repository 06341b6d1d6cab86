use std::collections::BTreeSet;

use serde_json::{json, Value};

use crate::config::OrchestratorConfig;
use crate::error::{OrchError, Result};
use crate::types::{ExperimentPlan, GridBatch, GridTask};

#[derive(Debug, Clone, Copy, PartialEq)]
struct MmrEntry {
    mmr: bool,
    lambda: f64,
}

fn normalize_mmr(value: &Value) -> Result<MmrEntry> {
    match value {
        Value::Bool(b) => Ok(MmrEntry {
            mmr: *b,
            lambda: if *b { 0.3 } else { 0.0 },
        }),
        Value::Null => Ok(MmrEntry { mmr: false, lambda: 0.0 }),
        Value::Number(n) => {
            let num = n.as_f64().ok_or_else(|| OrchError::plan_invalid(format!("invalid mmr configuration: {value}")))?;
            if num <= 0.0 {
                Ok(MmrEntry { mmr: false, lambda: 0.0 })
            } else {
                Ok(MmrEntry { mmr: true, lambda: num })
            }
        }
        other => Err(OrchError::plan_invalid(format!("invalid mmr configuration: {other}"))),
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}

fn sorted_unique_ints(values: &[Value]) -> Result<Vec<i64>> {
    let set: BTreeSet<i64> = values.iter().filter_map(as_i64).collect();
    if set.is_empty() {
        return Err(OrchError::plan_invalid("grid search values cannot be empty"));
    }
    Ok(set.into_iter().collect())
}

fn fmt_lambda(lambda: f64) -> String {
    format!("{lambda}").replace('.', "p")
}

/// Deterministic Cartesian product of top_k x mmr x ef_search, chunked into
/// fixed-size concurrency batches. Iteration order is top_k outer, mmr
/// (disabled first then ascending lambda) middle, ef_search inner.
pub fn make_grid(plan: &ExperimentPlan, config: &OrchestratorConfig) -> Result<Vec<GridBatch>> {
    let grid_cfg = &config.grid;
    let reflection_cfg = &config.reflection;

    let sample = grid_cfg.sample.unwrap_or(plan.sample_size);
    let concurrency = match plan.concurrency {
        Some(c) => c,
        None => grid_cfg.concurrency.unwrap_or(1),
    };
    if concurrency == 0 {
        return Err(OrchError::plan_invalid("grid concurrency must be positive"));
    }

    let top_k_values = sorted_unique_ints(&plan.search_space.top_k)?;
    let ef_search_values = sorted_unique_ints(&plan.search_space.ef_search)?;

    let mut mmr_entries: Vec<MmrEntry> = plan
        .search_space
        .mmr
        .iter()
        .map(normalize_mmr)
        .collect::<Result<Vec<_>>>()?;
    mmr_entries.sort_by(|a, b| {
        a.mmr
            .cmp(&b.mmr)
            .then_with(|| {
                let la = if a.mmr { a.lambda } else { 0.0 };
                let lb = if b.mmr { b.lambda } else { 0.0 };
                la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
            })
    });

    let mut tasks: Vec<GridTask> = Vec::new();
    for &top_k in &top_k_values {
        for mmr_entry in &mmr_entries {
            for &ef_search in &ef_search_values {
                let mut config_id_parts = vec![
                    plan.dataset.clone(),
                    format!("k{top_k}"),
                    format!("ef{ef_search}"),
                    if mmr_entry.mmr { "mmr".to_string() } else { "nommr".to_string() },
                ];
                if mmr_entry.mmr {
                    config_id_parts.push(format!("l{}", fmt_lambda(mmr_entry.lambda)));
                }
                let config_id = config_id_parts.join("-");
                let parameters = json!({
                    "dataset": plan.dataset,
                    "sample": sample,
                    "top_k": top_k,
                    "ef_search": ef_search,
                    "mmr": mmr_entry.mmr,
                    "mmr_lambda": if mmr_entry.mmr { mmr_entry.lambda } else { 0.0 },
                    "budget": plan.budget,
                    "concurrency": concurrency,
                    "reflection": reflection_cfg,
                });
                tasks.push(GridTask { config_id, parameters });
            }
        }
    }

    let mut batches = Vec::new();
    for (batch_index, chunk) in tasks.chunks(concurrency).enumerate() {
        batches.push(GridBatch {
            batch_id: format!("grid-batch-{:02}", batch_index + 1),
            tasks: chunk.to_vec(),
            concurrency,
        });
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SearchSpace;

    fn plan_with(top_k: Vec<Value>, mmr: Vec<Value>, ef_search: Vec<Value>, concurrency: Option<usize>) -> ExperimentPlan {
        ExperimentPlan {
            dataset: "fiqa".to_string(),
            sample_size: 100,
            search_space: SearchSpace { top_k, mmr, ef_search },
            budget: Default::default(),
            concurrency,
            baseline_id: None,
            metadata: Default::default(),
        }
    }

    #[test]
    fn grid_is_deterministic_cartesian_product() {
        let plan = plan_with(
            vec![json!(10), json!(20)],
            vec![json!(false), json!(true)],
            vec![json!(32)],
            Some(4),
        );
        let config = OrchestratorConfig::default();
        let batches = make_grid(&plan, &config).unwrap();
        let all_tasks: Vec<_> = batches.iter().flat_map(|b| b.tasks.iter()).collect();
        assert_eq!(all_tasks.len(), 4);
        assert_eq!(all_tasks[0].config_id, "fiqa-k10-ef32-nommr");
        assert_eq!(all_tasks[1].config_id, "fiqa-k10-ef32-mmr-l0p3");
        assert_eq!(all_tasks[2].config_id, "fiqa-k20-ef32-nommr");
    }

    #[test]
    fn batches_chunk_by_concurrency() {
        let plan = plan_with(vec![json!(10), json!(20), json!(30)], vec![json!(false)], vec![json!(32)], Some(2));
        let config = OrchestratorConfig::default();
        let batches = make_grid(&plan, &config).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].tasks.len(), 2);
        assert_eq!(batches[1].tasks.len(), 1);
        assert_eq!(batches[0].batch_id, "grid-batch-01");
        assert_eq!(batches[1].batch_id, "grid-batch-02");
    }

    #[test]
    fn zero_concurrency_is_plan_invalid() {
        let plan = plan_with(vec![json!(10)], vec![json!(false)], vec![json!(32)], Some(0));
        let config = OrchestratorConfig::default();
        assert!(make_grid(&plan, &config).is_err());
    }

    #[test]
    fn empty_search_values_is_plan_invalid() {
        let plan = plan_with(vec![], vec![json!(false)], vec![json!(32)], Some(1));
        let config = OrchestratorConfig::default();
        assert!(make_grid(&plan, &config).is_err());
    }
}
