//! Downstream record sinks
//!
//! A sink receives the records an integration exports, one stream per
//! (integration, object type), and a finalization marker when the stream is
//! done. [`JsonlSink`] writes JSON Lines files for the downstream pipeline to
//! pick up.

use crate::config::is_plain_file_name;
use crate::{AgentError, Result};
use agent_rpc::{IntegrationId, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Destination of exported records
pub trait RecordSink: Send + Sync {
    /// Append a batch. The batch is written completely or the call fails.
    fn write(&self, id: &IntegrationId, object_type: &str, records: &[Record]) -> Result<()>;

    /// Mark the object type's stream for this run as complete
    fn finish(
        &self,
        id: &IntegrationId,
        object_type: &str,
        last_processed: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

/// Marker line written after the last record of a finished stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoneMarker {
    #[serde(rename = "_done")]
    pub done: bool,
    pub object_type: String,
    pub last_processed: Option<DateTime<Utc>>,
}

/// One line of an export file
#[derive(Debug, Clone, PartialEq)]
pub enum ExportLine {
    Record(Record),
    Done(DoneMarker),
}

/// Buffered append-only JSONL file
pub struct JsonlWriter {
    writer: BufWriter<File>,
}

impl JsonlWriter {
    /// Append to an existing JSONL file, creating it if needed
    pub fn append(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn write<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        writeln!(self.writer, "{}", json)?;
        Ok(())
    }

    /// Flush the buffer to disk
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Read every line of an export file
pub fn read_export(path: impl AsRef<Path>) -> Result<Vec<ExportLine>> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        let record: Record = serde_json::from_str(&line)
            .map_err(|e| AgentError::Other(format!("Invalid JSONL: {}", e)))?;
        if record.get("_done").and_then(|v| v.as_bool()) == Some(true) {
            let marker = serde_json::from_value(serde_json::Value::Object(record))?;
            lines.push(ExportLine::Done(marker));
        } else {
            lines.push(ExportLine::Record(record));
        }
    }

    Ok(lines)
}

/// Writes `<root>/exports/<integration>/<objectType>.jsonl`
pub struct JsonlSink {
    dir: PathBuf,
    writers: Mutex<HashMap<(IntegrationId, String), JsonlWriter>>,
}

impl JsonlSink {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.join("exports"),
            writers: Mutex::new(HashMap::new()),
        }
    }

    /// File that receives records of `object_type` from `id`.
    ///
    /// Both parts must stay a single entry under `exports/`.
    pub fn path_for(&self, id: &IntegrationId, object_type: &str) -> Result<PathBuf> {
        let integration = id.to_string();
        if !is_plain_file_name(&integration) {
            return Err(AgentError::DeliveryFailed(format!(
                "integration {:?} cannot name an export directory",
                integration
            )));
        }
        if !is_plain_file_name(object_type) {
            return Err(AgentError::DeliveryFailed(format!(
                "object type {:?} cannot name an export file",
                object_type
            )));
        }

        Ok(self
            .dir
            .join(integration)
            .join(format!("{}.jsonl", object_type)))
    }

    fn with_writer<T>(
        &self,
        id: &IntegrationId,
        object_type: &str,
        f: impl FnOnce(&mut JsonlWriter) -> Result<T>,
    ) -> Result<T> {
        let mut writers = self
            .writers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let key = (id.clone(), object_type.to_string());

        if !writers.contains_key(&key) {
            let path = self.path_for(id, object_type)?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            tracing::debug!(path = %path.display(), "Opening export file");
            writers.insert(key.clone(), JsonlWriter::append(&path)?);
        }

        match writers.get_mut(&key) {
            Some(writer) => f(writer),
            None => Err(AgentError::Other(format!(
                "export writer for {}/{} missing",
                id, object_type
            ))),
        }
    }
}

impl RecordSink for JsonlSink {
    fn write(&self, id: &IntegrationId, object_type: &str, records: &[Record]) -> Result<()> {
        self.with_writer(id, object_type, |writer| {
            for record in records {
                writer.write(record)?;
            }
            writer.flush()
        })
    }

    fn finish(
        &self,
        id: &IntegrationId,
        object_type: &str,
        last_processed: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_writer(id, object_type, |writer| {
            writer.write(&DoneMarker {
                done: true,
                object_type: object_type.to_string(),
                last_processed,
            })?;
            writer.flush()
        })?;

        self.writers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&(id.clone(), object_type.to_string()));
        Ok(())
    }
}

/// Captures records in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<(IntegrationId, String, Record)>>,
    finished: Mutex<Vec<(IntegrationId, String, Option<DateTime<Utc>>)>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Records received for one object type, in order
    pub fn records(&self, object_type: &str) -> Vec<Record> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|(_, t, _)| t == object_type)
            .map(|(_, _, r)| r.clone())
            .collect()
    }

    pub fn total(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Finished streams as (integration, object type, last processed)
    pub fn finished(&self) -> Vec<(IntegrationId, String, Option<DateTime<Utc>>)> {
        self.finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl RecordSink for MemorySink {
    fn write(&self, id: &IntegrationId, object_type: &str, records: &[Record]) -> Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(AgentError::DeliveryFailed(format!(
                "sink rejected {} records",
                records.len()
            )));
        }
        let mut stored = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for record in records {
            stored.push((id.clone(), object_type.to_string(), record.clone()));
        }
        Ok(())
    }

    fn finish(
        &self,
        id: &IntegrationId,
        object_type: &str,
        last_processed: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id.clone(), object_type.to_string(), last_processed));
        Ok(())
    }
}
