//! Reference log backends.

use super::{LogBackend, LogRecord, LogScope};
use crate::error::Result;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Emits each record as a structured `tracing` event on the `lighter::stats` target.
///
/// Step records are logged at `debug`, epoch records at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingBackend;

impl LogBackend for TracingBackend {
    fn record(&mut self, record: &LogRecord) -> Result<()> {
        match record.scope {
            LogScope::Step { global_step } => tracing::debug!(
                target: "lighter::stats",
                name = %record.name,
                value = record.value,
                global_step,
                "step stats"
            ),
            LogScope::Epoch { epoch } => tracing::info!(
                target: "lighter::stats",
                name = %record.name,
                value = record.value,
                epoch,
                "epoch stats"
            ),
        }
        Ok(())
    }
}

/// Keeps records in a shared buffer. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Records whose name equals `name`, in emission order.
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.records()
            .into_iter()
            .filter(|r| r.name == name)
            .map(|r| r.value)
            .collect()
    }
}

impl LogBackend for MemoryBackend {
    fn record(&mut self, record: &LogRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.clone());
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonlLine<'a> {
    run_id: Uuid,
    #[serde(flatten)]
    record: &'a LogRecord,
}

/// Appends one JSON object per record to a file, tagged with a per-run id.
#[derive(Debug)]
pub struct JsonlBackend {
    path: PathBuf,
    run_id: Uuid,
    writer: BufWriter<File>,
}

impl JsonlBackend {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let run_id = Uuid::new_v4();
        tracing::info!(path = %path.display(), %run_id, "writing stats to jsonl");
        Ok(Self {
            path,
            run_id,
            writer: BufWriter::new(file),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogBackend for JsonlBackend {
    fn record(&mut self, record: &LogRecord) -> Result<()> {
        let line = serde_json::to_string(&JsonlLine {
            run_id: self.run_id,
            record,
        })?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_shares_buffer() {
        let memory = MemoryBackend::new();
        let mut handle = memory.clone();
        handle
            .record(&LogRecord::new("train/loss/step", 0.5, LogScope::Step { global_step: 0 }))
            .unwrap();
        assert_eq!(memory.values("train/loss/step"), vec![0.5]);
    }

    #[test]
    fn test_jsonl_backend_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("stats.jsonl");
        let mut backend = JsonlBackend::create(&path).unwrap();
        backend
            .record(&LogRecord::new("val/loss/epoch", 1.25, LogScope::Epoch { epoch: 3 }))
            .unwrap();
        backend.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(line["name"], "val/loss/epoch");
        assert_eq!(line["value"], 1.25);
        assert_eq!(line["scope"], "epoch");
        assert_eq!(line["epoch"], 3);
        assert_eq!(line["run_id"], backend.run_id().to_string());
    }
}
