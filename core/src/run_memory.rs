use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::Result;
use crate::types::RunRecord;

/// Durable store for `RunRecord`. A single global lock guards every metadata
/// merge, matching the source's single-lock discipline for this store.
pub struct RunMemory {
    base_dir: PathBuf,
    lock: Mutex<()>,
}

impl RunMemory {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        RunMemory {
            base_dir: base_dir.into(),
            lock: Mutex::new(()),
        }
    }

    fn record_path(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(format!("{run_id}.json"))
    }

    fn index_path(&self) -> PathBuf {
        self.base_dir.join("runs.jsonl")
    }

    fn write_atomic(&self, path: &PathBuf, contents: &str) -> Result<()> {
        fs::create_dir_all(&self.base_dir)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn write_record(&self, record: &RunRecord) -> Result<()> {
        let contents = serde_json::to_string_pretty(record)?;
        self.write_atomic(&self.record_path(&record.run_id), &contents)
    }

    fn append_index(&self, record: &RunRecord) -> Result<()> {
        fs::create_dir_all(&self.base_dir)?;
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.index_path())?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Writes both a per-run file and appends one line to the runs index.
    pub fn register_plan(&self, run_id: &str, plan: Value) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let record = RunRecord {
            run_id: run_id.to_string(),
            plan,
            metadata: serde_json::Map::new(),
        };
        self.append_index(&record)?;
        self.write_record(&record)
    }

    /// Prefers the per-run file; falls back to a linear scan of the index.
    pub fn get(&self, run_id: &str) -> Option<RunRecord> {
        let path = self.record_path(run_id);
        if let Ok(contents) = fs::read_to_string(&path) {
            if let Ok(record) = serde_json::from_str::<RunRecord>(&contents) {
                return Some(record);
            }
        }
        let Ok(file) = std::fs::File::open(self.index_path()) else {
            return None;
        };
        let reader = BufReader::new(file);
        reader
            .lines()
            .map_while(std::result::Result::ok)
            .filter_map(|line| serde_json::from_str::<RunRecord>(&line).ok())
            .find(|r| r.run_id == run_id)
    }

    /// Read-modify-write under the global lock, shallow-merging top-level
    /// keys of `merge` into `record.metadata`. A record absent from the store
    /// is created fresh.
    pub fn update_metadata(&self, run_id: &str, merge: serde_json::Map<String, Value>) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut record = self.get(run_id).unwrap_or_else(|| RunRecord {
            run_id: run_id.to_string(),
            plan: Value::Null,
            metadata: serde_json::Map::new(),
        });
        for (k, v) in merge {
            record.metadata.insert(k, v);
        }
        self.write_record(&record)
    }

    pub fn base_dir(&self) -> &std::path::Path {
        &self.base_dir
    }

    /// Distinct run ids ever registered, in first-seen order. Used by the
    /// scheduler's idempotency check to scan completed runs.
    pub fn list_run_ids(&self) -> Vec<String> {
        let Ok(file) = std::fs::File::open(self.index_path()) else {
            return Vec::new();
        };
        let reader = BufReader::new(file);
        let mut seen = std::collections::HashSet::new();
        let mut ids = Vec::new();
        for record in reader
            .lines()
            .map_while(std::result::Result::ok)
            .filter_map(|line| serde_json::from_str::<RunRecord>(&line).ok())
        {
            if seen.insert(record.run_id.clone()) {
                ids.push(record.run_id);
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mem = RunMemory::new(dir.path());
        mem.register_plan("r1", serde_json::json!({"dataset": "x"})).unwrap();
        let record = mem.get("r1").unwrap();
        assert_eq!(record.plan["dataset"], "x");
    }

    #[test]
    fn update_metadata_merges_shallow_not_deep() {
        let dir = tempfile::tempdir().unwrap();
        let mem = RunMemory::new(dir.path());
        mem.register_plan("r1", serde_json::json!({})).unwrap();
        let mut m1 = serde_json::Map::new();
        m1.insert("smoke".to_string(), serde_json::json!({"a": 1}));
        mem.update_metadata("r1", m1).unwrap();
        let mut m2 = serde_json::Map::new();
        m2.insert("grid".to_string(), serde_json::json!({"b": 2}));
        mem.update_metadata("r1", m2).unwrap();
        let record = mem.get("r1").unwrap();
        assert_eq!(record.metadata["smoke"]["a"], 1);
        assert_eq!(record.metadata["grid"]["b"], 2);
    }

    #[test]
    fn get_falls_back_to_index_when_per_run_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mem = RunMemory::new(dir.path());
        mem.register_plan("r1", serde_json::json!({"dataset": "y"})).unwrap();
        std::fs::remove_file(dir.path().join("r1.json")).unwrap();
        let record = mem.get("r1").unwrap();
        assert_eq!(record.plan["dataset"], "y");
    }

    #[test]
    fn list_run_ids_is_distinct_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let mem = RunMemory::new(dir.path());
        mem.register_plan("r1", serde_json::json!({})).unwrap();
        mem.register_plan("r2", serde_json::json!({})).unwrap();
        assert_eq!(mem.list_run_ids(), vec!["r1", "r2"]);
    }
}
