use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Resolved configuration consumed by the core. The core never reads a config
/// file itself; an ambient caller (the CLI binary, or a test fixture) builds
/// one of these and passes it into the composition root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub reports_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub run: RunSection,
    pub datasets: DatasetsSection,
    pub budget: BudgetSection,
    pub base_url: String,
    pub allowed_hosts: Vec<String>,
    pub host_aliases: HashMap<String, String>,
    pub health_endpoints: Vec<String>,
    pub health_timeout_s: f64,
    pub runner_cmd: String,
    pub runner_timeout_s: f64,
    pub mock_runner: bool,
    pub smoke: StageSection,
    pub grid: GridSection,
    pub ab: StageSection,
    pub reflection: ReflectionSection,
    pub llm: LlmSection,
    pub sla_policy_path: Option<PathBuf>,
    pub policies_path: Option<PathBuf>,
    pub baseline_policy: Option<String>,
    pub winners_source: Option<PathBuf>,
    pub audit_cmd: String,
    pub audit_port: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            reports_dir: PathBuf::from("reports"),
            runs_dir: PathBuf::from("runs"),
            run: RunSection::default(),
            datasets: DatasetsSection::default(),
            budget: BudgetSection::default(),
            base_url: String::new(),
            allowed_hosts: Vec::new(),
            host_aliases: HashMap::new(),
            health_endpoints: Vec::new(),
            health_timeout_s: 10.0,
            runner_cmd: String::new(),
            runner_timeout_s: 60.0,
            mock_runner: false,
            smoke: StageSection::default(),
            grid: GridSection::default(),
            ab: StageSection::default(),
            reflection: ReflectionSection::default(),
            llm: LlmSection::default(),
            sla_policy_path: None,
            policies_path: None,
            baseline_policy: None,
            winners_source: None,
            audit_cmd: String::new(),
            audit_port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    pub concurrency_limit: usize,
    pub queue_size: usize,
    pub dry_run_default: bool,
}

impl Default for RunSection {
    fn default() -> Self {
        RunSection {
            concurrency_limit: 2,
            queue_size: 10,
            dry_run_default: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetsSection {
    pub whitelist: Vec<String>,
    pub disabled: Vec<String>,
    pub queries_map: HashMap<String, String>,
    pub qrels_map: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    pub max_concurrent_runs: Option<usize>,
    pub max_tokens: Option<u64>,
    pub max_cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSection {
    pub sample: Option<u64>,
    pub top_k: Option<i64>,
    pub mmr: Option<serde_json::Value>,
    pub concurrency: Option<usize>,
    pub timeout_s: f64,
    pub max_retries: u32,
    pub backoff_s: f64,
    pub rate_limit_per_sec: f64,
}

impl Default for StageSection {
    fn default() -> Self {
        StageSection {
            sample: None,
            top_k: None,
            mmr: None,
            concurrency: None,
            timeout_s: 30.0,
            max_retries: 3,
            backoff_s: 1.0,
            rate_limit_per_sec: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSection {
    pub sample: Option<u64>,
    pub concurrency: Option<usize>,
    pub seed: u64,
}

impl Default for GridSection {
    fn default() -> Self {
        GridSection {
            sample: None,
            concurrency: None,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionSection {
    pub failure_rate: f64,
    pub recall_variance: f64,
}

impl Default for ReflectionSection {
    fn default() -> Self {
        ReflectionSection {
            failure_rate: 0.3,
            recall_variance: 0.02,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub enable: bool,
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub cost_cap_usd: f64,
}

impl Default for LlmSection {
    fn default() -> Self {
        LlmSection {
            enable: false,
            provider: "openai-compatible".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: None,
            max_tokens: 512,
            temperature: 0.2,
            cost_cap_usd: 1.0,
        }
    }
}
