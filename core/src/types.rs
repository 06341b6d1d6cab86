use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const PIPELINE_STAGES: [&str; 5] = ["SMOKE", "GRID", "AB", "SELECT", "PUBLISH"];
const RUN_ID_PREFIX: &str = "orch";

pub fn generate_run_id() -> String {
    let ts = Utc::now().format("%Y%m%d%H%M%S");
    let suffix = &Uuid::new_v4().simple().to_string()[..12];
    format!("{RUN_ID_PREFIX}-{ts}-{suffix}")
}

pub fn utc_timestamp() -> String {
    Utc::now().to_rfc3339()
}

/// A client-submitted experiment plan. Immutable once accepted by the
/// scheduler; `metadata` is filled in further by policy injection and
/// alignment resolution before the fingerprint is computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentPlan {
    pub dataset: String,
    pub sample_size: u64,
    pub search_space: SearchSpace,
    #[serde(default)]
    pub budget: BTreeMap<String, Value>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub baseline_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSpace {
    pub top_k: Vec<Value>,
    pub mmr: Vec<Value>,
    pub ef_search: Vec<Value>,
}

impl ExperimentPlan {
    /// Serializes the plan with `metadata` removed, used for `args_fp`.
    pub fn to_value_without_metadata(&self) -> Value {
        serde_json::json!({
            "dataset": self.dataset,
            "sample_size": self.sample_size,
            "search_space": self.search_space,
            "budget": self.budget,
            "concurrency": self.concurrency,
            "baseline_id": self.baseline_id,
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Named baseline parameter bundle resolved from an external policy store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub dataset: String,
    pub queries_path: String,
    pub qrels_path: String,
    pub top_k: i64,
    #[serde(default)]
    pub mmr: Value,
    #[serde(default)]
    pub mmr_lambda: Option<f64>,
    pub ef_search: i64,
}

/// Deterministic idempotency key: four 16-hex-char SHA-256 prefixes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FingerprintKey {
    pub data_fp: String,
    pub code_commit: String,
    pub policy_fp: String,
    pub args_fp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridTask {
    pub config_id: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridBatch {
    pub batch_id: String,
    pub tasks: Vec<GridTask>,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub run_id: String,
    pub event_type: String,
    pub payload: Value,
    pub created_at: String,
}

impl Event {
    pub fn new(run_id: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Event {
            run_id: run_id.into(),
            event_type: event_type.into(),
            payload,
            created_at: utc_timestamp(),
        }
    }
}

/// Durable per-run record. `metadata` is merged shallowly on every update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub plan: Value,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub metrics: Value,
    pub metrics_paths: Vec<String>,
    pub decision: Option<ReflectionDecision>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionDecision {
    pub action: String,
    pub reason: String,
}

impl ReflectionDecision {
    pub fn to_value(&self) -> Value {
        serde_json::json!({"action": self.action, "reason": self.reason})
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextAction {
    pub id: String,
    pub label: String,
    pub eta_min: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionResult {
    pub stage: String,
    pub model: String,
    pub tokens: u64,
    pub cost_usd: f64,
    pub confidence: f64,
    pub cache_hit: bool,
    pub blocked: bool,
    pub elapsed_ms: u64,
    pub prompt_hash: String,
    pub rationale_md: String,
    pub rationale_md_lite: String,
    pub next_actions: Vec<NextAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SlaStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaCheck {
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub status: SlaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaVerdict {
    pub verdict: SlaStatus,
    pub checks: Vec<SlaCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
