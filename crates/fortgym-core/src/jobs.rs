//! Batch jobs: N runs driven by at most P workers.
//!
//! `start` builds every engine up front (all runs exist in `Created` before
//! any worker starts), queues them, and spawns exactly `min(P, N)` workers.
//! Each worker pops one engine at a time and drives it to a terminal state,
//! so no more than P runs are ever `Running` for one job. A supervisor task
//! waits for the workers, cancels whatever is still queued, and marks the
//! job done.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use fortgym_trace::{RunId, RunStatus};

use crate::domain::{FortGymError, Result, Run};
use crate::engine::{CancellationFlag, StepEngine};
use crate::metrics::METRICS;
use crate::obs;

/// Builds the engine for the `index`-th run of a job.
pub trait RunFactory: Send + Sync {
    fn build(&self, index: usize) -> Result<StepEngine>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// No worker has picked up a run yet.
    Pending,
    Running,
    Done,
    /// Finished after a cancel request.
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub total: usize,
    pub parallelism: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Most runs ever driven at the same time.
    pub peak_running: usize,
    pub run_ids: Vec<RunId>,
}

#[derive(Debug, Default)]
struct JobCounters {
    pending: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
    peak_running: AtomicUsize,
}

impl JobCounters {
    fn started(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);
    }

    fn finished(&self, status: RunStatus) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.tally(status);
    }

    fn cancelled_in_queue(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }

    fn tally(&self, status: RunStatus) {
        let counter = match status {
            RunStatus::Failed => &self.failed,
            RunStatus::Cancelled => &self.cancelled,
            _ => &self.completed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

type EngineQueue = Arc<Mutex<VecDeque<StepEngine>>>;

struct Job {
    id: JobId,
    total: usize,
    parallelism: usize,
    run_ids: Vec<RunId>,
    runs: Vec<watch::Receiver<Run>>,
    counters: Arc<JobCounters>,
    cancel: CancellationFlag,
    done: watch::Receiver<bool>,
}

impl Job {
    fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    fn status(&self) -> JobStatus {
        let c = &self.counters;
        let pending = c.pending.load(Ordering::SeqCst);
        let state = match (self.is_done(), self.cancel.is_cancelled()) {
            (false, _) if pending == self.total && self.total > 0 => JobState::Pending,
            (false, _) => JobState::Running,
            (true, false) => JobState::Done,
            (true, true) => JobState::Cancelled,
        };
        JobStatus {
            job_id: self.id.clone(),
            state,
            total: self.total,
            parallelism: self.parallelism,
            pending,
            running: c.running.load(Ordering::SeqCst),
            completed: c.completed.load(Ordering::SeqCst),
            failed: c.failed.load(Ordering::SeqCst),
            cancelled: c.cancelled.load(Ordering::SeqCst),
            peak_running: c.peak_running.load(Ordering::SeqCst),
            run_ids: self.run_ids.clone(),
        }
    }
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, Arc<Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build `n` runs and start driving them with `parallelism` workers.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(self, factory))]
    pub fn start(
        &self,
        n: usize,
        parallelism: usize,
        factory: Arc<dyn RunFactory>,
    ) -> Result<JobId> {
        if parallelism == 0 {
            return Err(FortGymError::InvalidJob(
                "parallelism must be at least 1".to_string(),
            ));
        }

        let engines = (0..n)
            .map(|i| factory.build(i))
            .collect::<Result<Vec<_>>>()?;
        let run_ids: Vec<RunId> = engines.iter().map(|e| e.run_id().clone()).collect();
        let runs: Vec<watch::Receiver<Run>> = engines.iter().map(|e| e.subscribe_run()).collect();

        let job_id = JobId::new();
        let counters = Arc::new(JobCounters::default());
        counters.pending.store(n, Ordering::SeqCst);
        let cancel = CancellationFlag::new();
        let (done_tx, done_rx) = watch::channel(false);
        let queue: EngineQueue = Arc::new(Mutex::new(engines.into_iter().collect()));

        let workers = parallelism.min(n);
        obs::emit_job_started(job_id.as_str(), n, workers);

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                tokio::spawn(worker(
                    Arc::clone(&queue),
                    Arc::clone(&counters),
                    cancel.clone(),
                ))
            })
            .collect();

        {
            let job_id = job_id.clone();
            let counters = Arc::clone(&counters);
            tokio::spawn(async move {
                for joined in futures::future::join_all(handles).await {
                    if let Err(e) = joined {
                        warn!(job_id = %job_id, error = %e, "job worker ended abnormally");
                    }
                }
                // Runs a lost worker was driving can never finish; count them failed.
                let stranded = counters.running.swap(0, Ordering::SeqCst);
                if stranded > 0 {
                    counters.failed.fetch_add(stranded, Ordering::SeqCst);
                }

                let leftovers: Vec<StepEngine> = queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .drain(..)
                    .collect();
                for mut engine in leftovers {
                    engine.finish(RunStatus::Cancelled).await;
                    counters.cancelled_in_queue();
                }

                done_tx.send_replace(true);
                obs::emit_job_finished(
                    job_id.as_str(),
                    counters.completed.load(Ordering::SeqCst) as u64,
                    counters.failed.load(Ordering::SeqCst) as u64,
                    counters.cancelled.load(Ordering::SeqCst) as u64,
                );
                METRICS.flush();
            });
        }

        let job = Arc::new(Job {
            id: job_id.clone(),
            total: n,
            parallelism,
            run_ids,
            runs,
            counters,
            cancel,
            done: done_rx,
        });
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id.clone(), job);
        Ok(job_id)
    }

    fn job(&self, job_id: &JobId) -> Result<Arc<Job>> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
            .ok_or_else(|| FortGymError::JobNotFound(job_id.to_string()))
    }

    pub fn status(&self, job_id: &JobId) -> Result<JobStatus> {
        Ok(self.job(job_id)?.status())
    }

    /// Live views of every run in the job.
    pub fn runs(&self, job_id: &JobId) -> Result<Vec<watch::Receiver<Run>>> {
        Ok(self.job(job_id)?.runs.clone())
    }

    /// Queued runs end `Cancelled` without executing; running ones stop at
    /// their next step boundary.
    pub fn cancel(&self, job_id: &JobId) -> Result<()> {
        let job = self.job(job_id)?;
        if job.is_done() {
            return Ok(());
        }
        job.cancel.cancel();
        debug!(job_id = %job_id, "job cancel requested");
        Ok(())
    }

    /// Wait until every run in the job is terminal.
    pub async fn wait(&self, job_id: &JobId) -> Result<JobStatus> {
        let job = self.job(job_id)?;
        let mut done = job.done.clone();
        // A closed channel means the supervisor is gone, which only happens after it finished.
        let _ = done.wait_for(|finished| *finished).await;
        Ok(job.status())
    }

    pub fn list(&self) -> Vec<JobStatus> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut statuses: Vec<JobStatus> = jobs.values().map(|job| job.status()).collect();
        statuses.sort_by(|a, b| a.job_id.as_str().cmp(b.job_id.as_str()));
        statuses
    }

    /// Forget a finished job.
    pub fn evict(&self, job_id: &JobId) -> Result<JobStatus> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let job = jobs
            .get(job_id)
            .ok_or_else(|| FortGymError::JobNotFound(job_id.to_string()))?;
        if !job.is_done() {
            return Err(FortGymError::JobStillActive(job_id.to_string()));
        }
        let status = job.status();
        jobs.remove(job_id);
        Ok(status)
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("JobRegistry")
            .field("jobs", &jobs.len())
            .finish()
    }
}

async fn worker(queue: EngineQueue, counters: Arc<JobCounters>, cancel: CancellationFlag) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let next = queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let Some(mut engine) = next else {
            break;
        };
        counters.started();
        let outcome = AssertUnwindSafe(engine.run(&cancel)).catch_unwind().await;
        let status = match outcome {
            Ok(run) => run.status,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                obs::emit_run_panicked(engine.run_id().as_str(), &message);
                engine.finish(RunStatus::Failed).await
            }
        };
        counters.finished(status);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "run panicked".to_string())
}
