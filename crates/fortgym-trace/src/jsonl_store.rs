//! File-backed [`TraceStore`]: one JSONL trace and one summary per run.
//!
//! Layout:
//!
//! ```text
//! <root>/<run_id>/trace.jsonl    one StepRecord per line, append-only
//! <root>/<run_id>/summary.json   RunSummary, atomically replaced
//! ```
//!
//! Every append is flushed and `fsync`ed before it returns. A torn final
//! line (crash mid-write) is ignored on read and cut off before the next
//! append, so the trace always ends on a record boundary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use crate::error::StorageError;
use crate::storage_traits::{RunId, RunSummary, StepRecord, StorageResult, TraceStore};

const TRACE_FILE: &str = "trace.jsonl";
const SUMMARY_FILE: &str = "summary.json";

/// Next expected step index per run; `None` until the file has been inspected.
type AppendSlot = Arc<tokio::sync::Mutex<Option<u64>>>;

/// JSONL trace store rooted at an artifacts directory.
#[derive(Debug)]
pub struct JsonlTraceStore {
    root: PathBuf,
    slots: Mutex<HashMap<RunId, AppendSlot>>,
}

impl JsonlTraceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.as_str())
    }

    pub fn trace_path(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join(TRACE_FILE)
    }

    pub fn summary_path(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join(SUMMARY_FILE)
    }

    fn slot(&self, run_id: &RunId) -> AppendSlot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(run_id.clone()).or_default())
    }

    /// Truncate a torn trailing line and return the number of whole records.
    async fn prepare_for_append(&self, run_id: &RunId) -> StorageResult<u64> {
        let path = self.trace_path(run_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let keep = bytes
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|pos| pos + 1)
            .unwrap_or(0);
        if keep != bytes.len() {
            warn!(run_id = %run_id, dropped_bytes = bytes.len() - keep, "truncating torn trace tail");
            let file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
            file.set_len(keep as u64).await?;
            file.sync_all().await?;
        }

        let count = bytes[..keep]
            .split(|b| *b == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .count();
        Ok(count as u64)
    }
}

#[async_trait]
impl TraceStore for JsonlTraceStore {
    #[instrument(skip(self, record), fields(run_id = %record.run_id, step_idx = record.step_idx), level = "debug")]
    async fn append_record(&self, record: &StepRecord) -> StorageResult<()> {
        let slot = self.slot(&record.run_id);
        let mut next = slot.lock().await;

        let expected = match *next {
            Some(n) => n,
            None => self.prepare_for_append(&record.run_id).await?,
        };
        if record.step_idx != expected {
            return Err(StorageError::OutOfOrder {
                run_id: record.run_id.to_string(),
                expected,
                actual: record.step_idx,
            });
        }

        tokio::fs::create_dir_all(self.run_dir(&record.run_id)).await?;

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.trace_path(&record.run_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        file.sync_data().await?;

        *next = Some(expected + 1);
        debug!(bytes = line.len(), "step record persisted");
        Ok(())
    }

    async fn load_records(&self, run_id: &RunId) -> StorageResult<Vec<StepRecord>> {
        let text = match tokio::fs::read_to_string(self.trace_path(run_id)).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::RunNotFound {
                    run_id: run_id.to_string(),
                })
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        let complete = text.ends_with('\n');
        let lines: Vec<&str> = text.lines().collect();
        let mut records = Vec::with_capacity(lines.len());

        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StepRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) if idx + 1 == lines.len() && !complete => {
                    warn!(run_id = %run_id, error = %e, "ignoring torn final trace line");
                }
                Err(e) => {
                    return Err(StorageError::Corrupt {
                        run_id: run_id.to_string(),
                        line: idx + 1,
                        reason: e.to_string(),
                    })
                }
            }
        }

        Ok(records)
    }

    async fn write_summary(&self, summary: &RunSummary) -> StorageResult<()> {
        let dir = self.run_dir(&summary.run_id);
        tokio::fs::create_dir_all(&dir).await?;

        let tmp = dir.join(format!("{SUMMARY_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(summary)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.flush().await?;
        file.sync_data().await?;
        drop(file);

        tokio::fs::rename(&tmp, self.summary_path(&summary.run_id)).await?;
        Ok(())
    }

    async fn load_summary(&self, run_id: &RunId) -> StorageResult<Option<RunSummary>> {
        match tokio::fs::read(self.summary_path(run_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn list_runs(&self) -> StorageResult<Vec<RunId>> {
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut runs = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if !path.join(TRACE_FILE).exists() && !path.join(SUMMARY_FILE).exists() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                runs.push(RunId(name.to_string()));
            }
        }
        runs.sort();
        Ok(runs)
    }
}
