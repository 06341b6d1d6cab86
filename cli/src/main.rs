use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orcheval_core::auditor::{Auditor, MockAuditor, SubprocessAuditor};
use orcheval_core::config::OrchestratorConfig;
use orcheval_core::event_log::EventLogger;
use orcheval_core::pipeline::Pipeline;
use orcheval_core::reflector::ReflectionCache;
use orcheval_core::run_memory::RunMemory;
use orcheval_core::runner::RunnerAdapter;
use orcheval_core::scheduler::Scheduler;
use orcheval_core::stage::StageExecutor;
use orcheval_core::types::{ExperimentPlan, Policy};

/// Retrieval-quality evaluation campaign orchestrator.
#[derive(Parser)]
#[command(name = "orcheval", version, about)]
struct Cli {
    /// Path to the orchestrator's TOML config. Defaults to
    /// `~/.config/orcheval/config.toml` when not given.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit an experiment plan.
    Start {
        /// Path to a JSON-encoded ExperimentPlan.
        plan: PathBuf,
        /// Preview the grid without enqueuing the run.
        #[arg(long)]
        dry_run: bool,
        /// Actually enqueue and execute the run. Without this flag the plan
        /// is always previewed, regardless of `--dry-run`.
        #[arg(long)]
        commit: bool,
    },
    /// Show a run's current status.
    Status {
        run_id: String,
        /// `lite` (default) prints the sanitized reflection summaries only;
        /// `full` also includes the run's plan and metadata.
        #[arg(long, default_value = "lite")]
        detail: String,
    },
    /// Print a run's published report artifacts.
    Report { run_id: String },
}

fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config/orcheval/config.toml")
}

fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading config at {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parsing config at {}", path.display()))
}

fn load_policies(path: Option<&Path>) -> Result<HashMap<String, Policy>> {
    let Some(path) = path else {
        return Ok(HashMap::new());
    };
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading policies at {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing policies at {}", path.display()))
}

fn build_auditor(config: &OrchestratorConfig) -> Arc<dyn Auditor> {
    if config.mock_runner || config.audit_cmd.trim().is_empty() {
        Arc::new(MockAuditor)
    } else {
        Arc::new(SubprocessAuditor::new(config.audit_cmd.clone()))
    }
}

/// Wires every component into a running `Scheduler`. The CLI is the only
/// place config files are read; `orcheval-core` never touches disk for its
/// own configuration.
fn build_scheduler(config: OrchestratorConfig) -> Result<Arc<Scheduler>> {
    let policies = load_policies(config.policies_path.as_deref())?;
    let config = Arc::new(config);

    let logger = Arc::new(EventLogger::new(config.reports_dir.join("events")));
    let memory = Arc::new(RunMemory::new(config.reports_dir.join("memory")));
    let runner = Arc::new(RunnerAdapter::new((*config).clone()));
    let reflection_cache = Arc::new(ReflectionCache::new(config.reports_dir.join("reflection_cache.jsonl")));
    let auditor = build_auditor(&config);
    let policies = Arc::new(policies);

    let stages = Arc::new(StageExecutor::new(
        Arc::clone(&config),
        Arc::clone(&logger),
        Arc::clone(&memory),
        Arc::clone(&runner),
        reflection_cache,
    ));
    let pipeline = Arc::new(Pipeline::new(stages, Arc::clone(&logger), Arc::clone(&memory), Arc::clone(&policies)));

    Ok(Scheduler::new(config, logger, memory, pipeline, runner, auditor, policies))
}

/// Since each CLI invocation is its own short-lived process, `start` waits
/// for a queued run's worker thread to reach a terminal status before the
/// process exits — otherwise the enqueued work would die with it.
fn await_terminal_status(scheduler: &Scheduler, run_id: &str) -> Result<serde_json::Value> {
    loop {
        let status = scheduler.get_status(run_id).map_err(|err| anyhow::anyhow!(err.to_payload().to_string()))?;
        match status["status"].as_str() {
            Some("completed") | Some("failed") => return Ok(status),
            _ => std::thread::sleep(std::time::Duration::from_millis(100)),
        }
    }
}

fn run_start(scheduler: &Scheduler, plan_path: &Path, dry_run: bool, commit: bool) -> Result<()> {
    let contents = std::fs::read_to_string(plan_path).with_context(|| format!("reading plan at {}", plan_path.display()))?;
    let plan: ExperimentPlan = serde_json::from_str(&contents).with_context(|| format!("parsing plan at {}", plan_path.display()))?;
    // Absence of `--dry-run` defers to the scheduler's own default rather
    // than forcing `false` — only `--commit` can make a real run happen.
    let dry_run = if dry_run { Some(true) } else { None };
    let result = scheduler.start(plan, dry_run, commit).map_err(|err| anyhow::anyhow!(err.to_payload().to_string()))?;

    let result = match result["status"].as_str() {
        Some("queued") | Some("duplicate") => await_terminal_status(scheduler, result["run_id"].as_str().unwrap_or_default())?,
        _ => result,
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn run_status(scheduler: &Scheduler, run_id: &str, detail: &str) -> Result<()> {
    let mut status = scheduler.get_status(run_id).map_err(|err| anyhow::anyhow!(err.to_payload().to_string()))?;
    if detail != "full" {
        if let Some(obj) = status.as_object_mut() {
            obj.remove("plan");
            obj.remove("metadata");
        }
    }
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn run_report(scheduler: &Scheduler, run_id: &str) -> Result<()> {
    let artifacts = scheduler.get_report_artifacts(run_id).map_err(|err| anyhow::anyhow!(err.to_payload().to_string()))?;
    println!("{}", serde_json::to_string_pretty(&artifacts)?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;
    let scheduler = build_scheduler(config)?;

    match cli.command {
        Command::Start { plan, dry_run, commit } => run_start(&scheduler, &plan, dry_run, commit),
        Command::Status { run_id, detail } => run_status(&scheduler, &run_id, &detail),
        Command::Report { run_id } => run_report(&scheduler, &run_id),
    }
}
