use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::Result;
use crate::types::Event;

/// Append-only per-run JSONL event log. One mutex per run_id, lazily
/// allocated under a meta-lock, so concurrent runs never contend on each
/// other's file.
pub struct EventLogger {
    base_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EventLogger {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        EventLogger {
            base_dir: base_dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn event_path(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(format!("{run_id}.jsonl"))
    }

    fn get_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        let mut guard = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Idempotent: creates the file if absent, never truncates an existing one.
    pub fn initialize(&self, run_id: &str) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        let path = self.event_path(run_id);
        let lock = self.get_lock(run_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        if !path.exists() {
            File::create(&path)?;
        }
        Ok(())
    }

    pub fn log_event(&self, run_id: &str, event_type: &str, payload: Value) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        let event = Event::new(run_id, event_type, payload);
        let line = serde_json::to_string(&event)?;
        let lock = self.get_lock(run_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.event_path(run_id))?;
        writeln!(file, "{line}")?;
        tracing::info!(run_id, event_type, "event logged");
        Ok(())
    }

    /// Synthesizes `event_type = "<STAGE>_<STATUS>"` and ensures `payload.stage`
    /// is set if not already present.
    pub fn log_stage_event(
        &self,
        run_id: &str,
        stage: &str,
        status: &str,
        mut payload: Value,
    ) -> Result<()> {
        let event_type = format!("{}_{}", stage.to_uppercase(), status.to_uppercase());
        if let Value::Object(ref mut map) = payload {
            map.entry("stage")
                .or_insert_with(|| Value::String(stage.to_uppercase()));
        }
        self.log_event(run_id, &event_type, payload)
    }

    /// Returns at most `limit` most-recent events (line order preserved), or
    /// every event when `limit` is `None`. A missing file returns an empty
    /// vector, not an error.
    pub fn read_events(&self, run_id: &str, limit: Option<usize>) -> Vec<Event> {
        let path = self.event_path(run_id);
        let Ok(file) = File::open(&path) else {
            return Vec::new();
        };
        let reader = BufReader::new(file);
        let lines: Vec<String> = reader
            .lines()
            .map_while(std::result::Result::ok)
            .filter(|l| !l.trim().is_empty())
            .collect();

        let selected: Vec<&String> = match limit {
            Some(n) if n > 0 && n < lines.len() => lines[lines.len() - n..].iter().collect(),
            _ => lines.iter().collect(),
        };

        selected
            .into_iter()
            .filter_map(|line| serde_json::from_str::<Event>(line).ok())
            .collect()
    }

    pub fn event_file_path(&self, run_id: &str) -> PathBuf {
        self.event_path(run_id)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLogger::new(dir.path());
        log.initialize("r1").unwrap();
        log.log_event("r1", "RUN_STARTED", serde_json::json!({})).unwrap();
        log.initialize("r1").unwrap();
        assert_eq!(log.read_events("r1", None).len(), 1);
    }

    #[test]
    fn read_events_respects_limit_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLogger::new(dir.path());
        for i in 0..5 {
            log.log_event("r1", &format!("EVT_{i}"), serde_json::json!({})).unwrap();
        }
        let last_two = log.read_events("r1", Some(2));
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].event_type, "EVT_3");
        assert_eq!(last_two[1].event_type, "EVT_4");
    }

    #[test]
    fn missing_run_returns_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLogger::new(dir.path());
        assert!(log.read_events("nope", None).is_empty());
    }

    #[test]
    fn invalid_lines_skipped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLogger::new(dir.path());
        log.initialize("r1").unwrap();
        {
            let mut f = OpenOptions::new()
                .append(true)
                .open(log.event_file_path("r1"))
                .unwrap();
            writeln!(f, "not json").unwrap();
        }
        log.log_event("r1", "OK", serde_json::json!({})).unwrap();
        assert_eq!(log.read_events("r1", None).len(), 1);
    }
}
