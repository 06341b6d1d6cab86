use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{OrchError, Result};

/// Result of checking that every qrels document id is present in the target
/// collection. `mismatch_rate > 0.0` means the dataset is misaligned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlignmentReport {
    #[serde(default)]
    pub checked: u64,
    #[serde(default)]
    pub found: u64,
    #[serde(default)]
    pub mismatch: u64,
    #[serde(default = "default_mismatch_rate")]
    pub mismatch_rate: f64,
}

fn default_mismatch_rate() -> f64 {
    1.0
}

/// Verifies qrels/collection alignment for a dataset. Abstracted behind a
/// trait so the scheduler's intake gate can be exercised without a real
/// auditor binary.
pub trait Auditor: Send + Sync {
    fn audit(&self, host: &str, collection: &str, qrels_path: &str) -> Result<AlignmentReport>;
}

/// Always reports a clean alignment. Used when `mock_runner` is set, matching
/// the runner's own mock path — an orchestrator exercised end-to-end without
/// a live backend shouldn't also require a live auditor binary.
pub struct MockAuditor;

impl Auditor for MockAuditor {
    fn audit(&self, _host: &str, _collection: &str, _qrels_path: &str) -> Result<AlignmentReport> {
        Ok(AlignmentReport { checked: 1, found: 1, mismatch: 0, mismatch_rate: 0.0 })
    }
}

/// Shells out to an external alignment-auditor command: `<cmd> --host <host>
/// --collection <collection> --qrels <qrels> --json-out <tmp>`, bounded by a
/// hard 5-minute timeout.
pub struct SubprocessAuditor {
    cmd: String,
    timeout: Duration,
}

impl SubprocessAuditor {
    pub fn new(cmd: impl Into<String>) -> Self {
        SubprocessAuditor { cmd: cmd.into(), timeout: Duration::from_secs(300) }
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
                return Err(OrchError::AlignmentBlock {
                    msg: "alignment check timed out".to_string(),
                    hint: Some("alignment-audit subprocess exceeded its 5 minute bound".to_string()),
                    details: None,
                });
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Auditor for SubprocessAuditor {
    fn audit(&self, host: &str, collection: &str, qrels_path: &str) -> Result<AlignmentReport> {
        let mut command = shlex::split(&self.cmd)
            .ok_or_else(|| OrchError::plan_invalid(format!("cannot parse alignment auditor command: {}", self.cmd)))?;
        if command.is_empty() {
            return Err(OrchError::plan_invalid("alignment auditor command is empty"));
        }

        let tmp_json: PathBuf = std::env::temp_dir().join(format!("alignment-{}.json", Uuid::new_v4().simple()));
        command.push("--host".into());
        command.push(host.to_string());
        command.push("--collection".into());
        command.push(collection.to_string());
        command.push("--qrels".into());
        command.push(qrels_path.to_string());
        command.push("--json-out".into());
        command.push(tmp_json.to_string_lossy().into_owned());

        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..]).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let child = cmd.spawn().map_err(|err| OrchError::AlignmentBlock {
            msg: format!("failed to spawn alignment auditor: {err}"),
            hint: Some("confirm the alignment auditor command is installed and executable".to_string()),
            details: None,
        })?;

        let status = Self::wait_with_timeout(child, self.timeout)?;
        let report = std::fs::read_to_string(&tmp_json).ok().and_then(|s| serde_json::from_str::<Value>(&s).ok());
        let _ = std::fs::remove_file(&tmp_json);

        if !status.success() {
            return Err(OrchError::AlignmentBlock {
                msg: format!("alignment auditor exited with {status}"),
                hint: Some("verify the qrels file and collection alignment".to_string()),
                details: report,
            });
        }

        let report = report.unwrap_or(Value::Null);
        serde_json::from_value(report).map_err(OrchError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_auditor_reports_clean_alignment() {
        let auditor = MockAuditor;
        let report = auditor.audit("http://example.invalid", "fiqa", "qrels.tsv").unwrap();
        assert_eq!(report.mismatch_rate, 0.0);
    }

    #[test]
    fn missing_command_is_plan_invalid() {
        let auditor = SubprocessAuditor::new("");
        let err = auditor.audit("http://example.invalid", "fiqa", "qrels.tsv").unwrap_err();
        assert_eq!(err.kind(), "PlanInvalid");
    }
}
