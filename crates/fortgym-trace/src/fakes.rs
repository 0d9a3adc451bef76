//! In-memory fake for the trace store (testing only)
//!
//! `MemoryTraceStore` satisfies the [`TraceStore`] contract without touching
//! the filesystem, and can be told to fail appends (the fatal persistence
//! path) or summary writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct RunTrace {
    records: Vec<StepRecord>,
    summary: Option<RunSummary>,
}

/// In-memory trace store backed by a `HashMap<RunId, RunTrace>`.
#[derive(Debug, Default)]
pub struct MemoryTraceStore {
    runs: Mutex<HashMap<RunId, RunTrace>>,
    fail_appends: AtomicBool,
    fail_summaries: AtomicBool,
}

impl MemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `append_record` fail with an I/O error.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `write_summary` fail with an I/O error.
    pub fn set_fail_summaries(&self, fail: bool) {
        self.fail_summaries.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TraceStore for MemoryTraceStore {
    async fn append_record(&self, record: &StepRecord) -> StorageResult<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected append failure",
            )));
        }
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let trace = runs.entry(record.run_id.clone()).or_default();
        let expected = trace.records.len() as u64;
        if record.step_idx != expected {
            return Err(StorageError::OutOfOrder {
                run_id: record.run_id.to_string(),
                expected,
                actual: record.step_idx,
            });
        }
        trace.records.push(record.clone());
        Ok(())
    }

    async fn load_records(&self, run_id: &RunId) -> StorageResult<Vec<StepRecord>> {
        let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        runs.get(run_id)
            .filter(|t| !t.records.is_empty())
            .map(|t| t.records.clone())
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    async fn write_summary(&self, summary: &RunSummary) -> StorageResult<()> {
        if self.fail_summaries.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected summary failure",
            )));
        }
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        runs.entry(summary.run_id.clone()).or_default().summary = Some(summary.clone());
        Ok(())
    }

    async fn load_summary(&self, run_id: &RunId) -> StorageResult<Option<RunSummary>> {
        let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(runs.get(run_id).and_then(|t| t.summary.clone()))
    }

    async fn list_runs(&self) -> StorageResult<Vec<RunId>> {
        let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<RunId> = runs.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
