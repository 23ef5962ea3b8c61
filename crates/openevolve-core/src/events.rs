//! Append-only JSONL event log under the run directory.

use crate::model::now_rfc3339;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Serialize)]
pub struct SlotEvent {
    pub ts: String,
    pub run_id: String,
    pub generation: i64,
    pub slot: usize,
    pub cand_id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize)]
pub struct GenerationEvent {
    pub ts: String,
    pub run_id: String,
    pub generation: i64,
    pub accepted: usize,
    pub rejected: usize,
    pub failed: usize,
    pub archive_size: usize,
}

pub struct EventLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl EventLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append<T: Serialize>(&self, event: &T) -> std::io::Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = self.file.lock().unwrap();
        file.write_all(line.as_bytes())?;
        file.flush()
    }
}

pub fn stamp() -> String {
    now_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_append_as_one_json_object_per_line() {
        let dir = std::env::temp_dir().join(format!("evolve-events-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("events.jsonl");
        let log = EventLog::open(&path).unwrap();

        log.append(&GenerationEvent {
            ts: stamp(),
            run_id: "r1".into(),
            generation: 1,
            accepted: 1,
            rejected: 0,
            failed: 0,
            archive_size: 1,
        })
        .unwrap();
        log.append(&GenerationEvent {
            ts: stamp(),
            run_id: "r1".into(),
            generation: 2,
            accepted: 0,
            rejected: 1,
            failed: 0,
            archive_size: 1,
        })
        .unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(v["run_id"], "r1");
        }
        std::fs::remove_dir_all(&dir).ok();
    }
}
