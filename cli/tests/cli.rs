use std::io::Write;

use assert_cmd::Command;
use predicates::str::contains;

fn write_config(dir: &std::path::Path) -> std::path::PathBuf {
    let config_path = dir.join("config.toml");
    let mut file = std::fs::File::create(&config_path).unwrap();
    writeln!(
        file,
        r#"
reports_dir = "{reports}"
runs_dir = "{runs}"
mock_runner = true

[run]
concurrency_limit = 1
queue_size = 4
dry_run_default = false
"#,
        reports = dir.join("reports").display(),
        runs = dir.join("runs").display(),
    )
    .unwrap();
    config_path
}

fn write_plan(dir: &std::path::Path) -> std::path::PathBuf {
    let plan_path = dir.join("plan.json");
    std::fs::write(
        &plan_path,
        r#"{
            "dataset": "fiqa",
            "sample_size": 20,
            "search_space": {"top_k": [10], "mmr": [false], "ef_search": [32]},
            "budget": {},
            "concurrency": 1,
            "metadata": {
                "queries_path": "/data/fiqa/queries.jsonl",
                "qrels_path": "/data/fiqa/qrels.tsv"
            }
        }"#,
    )
    .unwrap();
    plan_path
}

#[test]
fn start_dry_run_previews_the_grid() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(dir.path());
    let plan_path = write_plan(dir.path());

    Command::cargo_bin("orcheval")
        .unwrap()
        .args(["--config", config_path.to_str().unwrap(), "start", plan_path.to_str().unwrap(), "--dry-run"])
        .assert()
        .success()
        .stdout(contains("\"status\": \"dry_run\""));
}

#[test]
fn status_of_unknown_run_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(dir.path());

    Command::cargo_bin("orcheval")
        .unwrap()
        .args(["--config", config_path.to_str().unwrap(), "status", "does-not-exist"])
        .assert()
        .failure();
}

#[test]
fn start_then_status_reports_progress() {
    // `start` is a single short-lived process, so it blocks on the run's
    // worker thread reaching a terminal status before it prints and exits --
    // there's no second process left alive afterward to keep running it.
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(dir.path());
    let plan_path = write_plan(dir.path());

    let output = Command::cargo_bin("orcheval")
        .unwrap()
        .args(["--config", config_path.to_str().unwrap(), "start", plan_path.to_str().unwrap(), "--commit"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(parsed["status"] == "completed" || parsed["status"] == "failed", "unexpected status: {parsed}");
    let run_id = parsed["run_id"].as_str().unwrap();

    let status_output = Command::cargo_bin("orcheval")
        .unwrap()
        .args(["--config", config_path.to_str().unwrap(), "status", run_id])
        .output()
        .unwrap();
    let status: serde_json::Value = serde_json::from_slice(&status_output.stdout).unwrap();
    assert_eq!(status["status"], parsed["status"]);
}
