use std::path::Path;

use crate::types::{SlaCheck, SlaStatus, SlaVerdict};

/// Verifies aggregate metrics against a YAML SLA policy file. Absent or
/// missing policy is treated as a pass (SLA checking is opt-in), a policy
/// file that fails to parse is treated as a warn, not a hard failure.
pub fn verify_sla(metrics: &serde_json::Value, sla_policy_path: Option<&Path>) -> SlaVerdict {
    let Some(path) = sla_policy_path else {
        return SlaVerdict {
            verdict: SlaStatus::Pass,
            checks: Vec::new(),
            reason: Some("no SLA policy configured".to_string()),
        };
    };
    if !path.exists() {
        return SlaVerdict {
            verdict: SlaStatus::Pass,
            checks: Vec::new(),
            reason: Some("SLA policy file not found".to_string()),
        };
    }

    let policy: serde_yaml::Value = match std::fs::read_to_string(path).ok().and_then(|s| serde_yaml::from_str(&s).ok()) {
        Some(p) => p,
        None => {
            return SlaVerdict {
                verdict: SlaStatus::Warn,
                checks: Vec::new(),
                reason: Some("failed to load SLA policy".to_string()),
            };
        }
    };

    let get_f64 = |key: &str, default: f64| -> f64 {
        policy.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
    };
    let metric_f64 = |key: &str| -> f64 { metrics.get(key).and_then(serde_json::Value::as_f64).unwrap_or(0.0) };

    let mut checks = Vec::new();
    let mut verdict = SlaStatus::Pass;

    // recall_at_10: higher is better, so the failure direction is "below threshold".
    let recall_threshold = get_f64("recall_at_10_min", 0.0);
    let recall = metric_f64("recall_at_10");
    if recall < recall_threshold {
        checks.push(SlaCheck { metric: "recall_at_10".into(), value: recall, threshold: recall_threshold, status: SlaStatus::Fail });
        verdict = SlaStatus::Fail;
    } else if recall < recall_threshold * 1.1 {
        checks.push(SlaCheck { metric: "recall_at_10".into(), value: recall, threshold: recall_threshold, status: SlaStatus::Warn });
        if verdict == SlaStatus::Pass {
            verdict = SlaStatus::Warn;
        }
    }

    // p95_ms: lower is better, so the failure direction is "above threshold".
    let p95_max = get_f64("p95_ms_max", f64::INFINITY);
    let p95 = metric_f64("p95_ms");
    if p95 > p95_max {
        checks.push(SlaCheck { metric: "p95_ms".into(), value: p95, threshold: p95_max, status: SlaStatus::Fail });
        verdict = SlaStatus::Fail;
    } else if p95 > p95_max * 0.9 {
        checks.push(SlaCheck { metric: "p95_ms".into(), value: p95, threshold: p95_max, status: SlaStatus::Warn });
        if verdict == SlaStatus::Pass {
            verdict = SlaStatus::Warn;
        }
    }

    // cost: same warn-at-90%-of-threshold tier as the other two checks.
    let cost_max = get_f64("cost_max", f64::INFINITY);
    let cost = metric_f64("cost");
    if cost > cost_max {
        checks.push(SlaCheck { metric: "cost".into(), value: cost, threshold: cost_max, status: SlaStatus::Fail });
        verdict = SlaStatus::Fail;
    } else if cost > cost_max * 0.9 {
        checks.push(SlaCheck { metric: "cost".into(), value: cost, threshold: cost_max, status: SlaStatus::Warn });
        if verdict == SlaStatus::Pass {
            verdict = SlaStatus::Warn;
        }
    }

    SlaVerdict { verdict, checks, reason: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn no_policy_passes() {
        let verdict = verify_sla(&json!({}), None);
        assert_eq!(verdict.verdict, SlaStatus::Pass);
    }

    #[test]
    fn missing_policy_file_passes() {
        let verdict = verify_sla(&json!({}), Some(Path::new("/does/not/exist.yaml")));
        assert_eq!(verdict.verdict, SlaStatus::Pass);
    }

    #[test]
    fn recall_below_threshold_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sla.yaml");
        std::fs::write(&path, "recall_at_10_min: 0.5\n").unwrap();
        let verdict = verify_sla(&json!({"recall_at_10": 0.3}), Some(&path));
        assert_eq!(verdict.verdict, SlaStatus::Fail);
    }

    #[test]
    fn cost_near_threshold_warns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sla.yaml");
        std::fs::write(&path, "cost_max: 10.0\n").unwrap();
        let verdict = verify_sla(&json!({"cost": 9.5}), Some(&path));
        assert_eq!(verdict.verdict, SlaStatus::Warn);
        assert_eq!(verdict.checks[0].metric, "cost");
    }

    #[test]
    fn all_within_bounds_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sla.yaml");
        std::fs::write(&path, "recall_at_10_min: 0.3\np95_ms_max: 500\ncost_max: 10.0\n").unwrap();
        let verdict = verify_sla(&json!({"recall_at_10": 0.9, "p95_ms": 100.0, "cost": 1.0}), Some(&path));
        assert_eq!(verdict.verdict, SlaStatus::Pass);
        assert!(verdict.checks.is_empty());
    }
}
