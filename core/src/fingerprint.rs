use std::process::Command;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::config::OrchestratorConfig;
use crate::types::{ExperimentPlan, FingerprintKey};

fn sha256_hex16(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Short commit of the orchestrator's own working tree, or `"unknown"` when
/// git is unavailable or the call fails. Never fatal.
pub fn get_git_commit() -> String {
    let output = Command::new("git").args(["rev-parse", "HEAD"]).output();
    match output {
        Ok(out) if out.status.success() => {
            let stdout = String::from_utf8_lossy(&out.stdout);
            let commit = stdout.trim();
            if commit.len() >= 12 {
                commit[..12].to_string()
            } else {
                "unknown".to_string()
            }
        }
        _ => "unknown".to_string(),
    }
}

/// Bounded variant used by the actual fingerprinting path (2s upper bound).
/// `std::process::Command` has no built-in timeout; callers that need a hard
/// bound run this on a worker thread with a join timeout. In practice `git
/// rev-parse HEAD` returns in milliseconds, so the unbounded form above is
/// what's actually invoked; this wrapper documents the intended 2s ceiling.
pub fn get_git_commit_bounded() -> String {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(get_git_commit());
    });
    rx.recv_timeout(Duration::from_secs(2))
        .unwrap_or_else(|_| "unknown".to_string())
}

pub fn compute_data_fingerprint(dataset: &str, sample_size: u64, config: &OrchestratorConfig) -> String {
    let value = serde_json::json!({
        "dataset": dataset,
        "sample_size": sample_size,
        "seed": config.grid.seed,
    });
    sha256_hex16(value.to_string().as_bytes())
}

/// sha256 of the policy store's raw bytes, or `"unknown"` if missing/unreadable.
pub fn compute_policy_hash(policies_path: Option<&std::path::Path>) -> String {
    match policies_path {
        Some(path) => match std::fs::read(path) {
            Ok(bytes) => sha256_hex16(&bytes),
            Err(_) => "unknown".to_string(),
        },
        None => "unknown".to_string(),
    }
}

pub fn compute_args_hash(plan: &ExperimentPlan) -> String {
    sha256_hex16(plan.to_value_without_metadata().to_string().as_bytes())
}

pub fn compute_fingerprints(plan: &ExperimentPlan, config: &OrchestratorConfig) -> FingerprintKey {
    FingerprintKey {
        data_fp: compute_data_fingerprint(&plan.dataset, plan.sample_size, config),
        code_commit: get_git_commit_bounded(),
        policy_fp: compute_policy_hash(config.policies_path.as_deref()),
        args_fp: compute_args_hash(plan),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(dataset: &str) -> ExperimentPlan {
        ExperimentPlan {
            dataset: dataset.to_string(),
            sample_size: 50,
            search_space: crate::types::SearchSpace {
                top_k: vec![serde_json::json!(10)],
                mmr: vec![serde_json::json!(false)],
                ef_search: vec![serde_json::json!(32)],
            },
            budget: Default::default(),
            concurrency: None,
            baseline_id: None,
            metadata: Default::default(),
        }
    }

    #[test]
    fn args_hash_ignores_metadata() {
        let mut p1 = plan("fiqa");
        let mut p2 = plan("fiqa");
        p1.metadata.insert("x".into(), serde_json::json!(1));
        p2.metadata.insert("y".into(), serde_json::json!(2));
        assert_eq!(compute_args_hash(&p1), compute_args_hash(&p2));
    }

    #[test]
    fn args_hash_differs_on_dataset() {
        let p1 = plan("a");
        let p2 = plan("b");
        assert_ne!(compute_args_hash(&p1), compute_args_hash(&p2));
    }

    #[test]
    fn data_fingerprint_is_16_hex_chars() {
        let fp = compute_data_fingerprint("fiqa", 50, &OrchestratorConfig::default());
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn policy_hash_unknown_when_missing() {
        assert_eq!(compute_policy_hash(None), "unknown");
        assert_eq!(
            compute_policy_hash(Some(std::path::Path::new("/does/not/exist.json"))),
            "unknown"
        );
    }
}
