//! FIFO dispatch of queued jobs onto a bounded worker pool.
//!
//! The ready queue only holds ids; the store stays authoritative. Every
//! execution, async or inline, holds one permit of the same semaphore, so the
//! number of `running` records never exceeds `max_workers`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use studio_core::{JobError, JobId, JobRecord, JobResult, JobStatus};

use crate::registry::{CancelToken, HandlerError, HandlerRegistry, JobContext};
use crate::store::{JobPatch, JobStore, StoreError};

/// Note stored on a running job cancelled by the user.
pub const CANCELLED_DURING_EXECUTION: &str = "Cancelled by user during execution.";

/// Error stored on jobs found `running` at startup.
pub const INTERRUPTED_BY_RESTART: &str =
    "Job interrupted: engine restarted before the job finished.";

/// Delay before a job whose claim hit a store error is offered to the pool again.
pub const CLAIM_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub current_running: usize,
    pub max_workers: usize,
    pub queue_depth: usize,
}

/// What startup recovery did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// `running` records marked `failed`.
    pub interrupted: usize,
    /// `queued` records put back on the ready queue.
    pub requeued: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    /// The claim lost to a cancellation; the record is already terminal.
    Skipped,
    /// The claim hit a store error; the record is still `queued`.
    ClaimFailed(StoreError),
    Finished(JobStatus),
    /// The final write failed; the record is still `running`.
    Lost(StoreError),
}

struct Inner {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    ready: Mutex<VecDeque<JobId>>,
    wake: Notify,
    slots: Arc<Semaphore>,
    max_workers: usize,
    active: Mutex<HashMap<JobId, CancelToken>>,
    stats: Mutex<SchedulerStats>,
}

/// Worker pool plus ready queue. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// `max_workers = 0` is allowed: nothing is ever dispatched.
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        max_workers: usize,
    ) -> Self {
        let max_workers = max_workers.min(Semaphore::MAX_PERMITS);
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                ready: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                slots: Arc::new(Semaphore::new(max_workers)),
                max_workers,
                active: Mutex::new(HashMap::new()),
                stats: Mutex::new(SchedulerStats {
                    max_workers,
                    ..SchedulerStats::default()
                }),
            }),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// Append a queued job to the ready queue and wake the dispatch loop.
    pub fn enqueue(&self, job_id: JobId) {
        lock(&self.inner.ready).push_back(job_id);
        self.inner.wake.notify_one();
    }

    /// Remove a job from the ready queue. `false` if it was not there.
    pub fn dequeue(&self, job_id: JobId) -> bool {
        let mut ready = lock(&self.inner.ready);
        match ready.iter().position(|id| *id == job_id) {
            Some(pos) => {
                ready.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Trip the cancel token of a job currently executing in this process.
    pub fn signal_cancel(&self, job_id: JobId) -> bool {
        match lock(&self.inner.active).get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = lock(&self.inner.stats).clone();
        stats.queue_depth = lock(&self.inner.ready).len();
        stats
    }

    /// Execute a queued job on the caller's behalf and return its final record.
    ///
    /// Waits for a free worker slot first, so with `max_workers = 0` this never
    /// returns. The execution runs on its own task: dropping the returned
    /// future does not abandon the job.
    ///
    /// A store error while claiming or finishing the job is returned as
    /// `JobError::Store`. A job that could not be claimed stays `queued` and
    /// is handed to the dispatch loop after [`CLAIM_RETRY_DELAY`].
    pub async fn run_inline(&self, job_id: JobId) -> JobResult<JobRecord> {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let permit = inner
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| JobError::store("worker pool is closed"))?;
            match inner.clone().run_job(job_id, permit).await {
                Outcome::ClaimFailed(err) => {
                    inner.retry_later(job_id);
                    Err(JobError::store(err.to_string()))
                }
                Outcome::Lost(err) => Err(JobError::store(err.to_string())),
                Outcome::Skipped | Outcome::Finished(_) => Ok(()),
            }
        });

        task.await
            .map_err(|err| JobError::store(format!("job task aborted: {err}")))??;
        Ok(self.inner.store.get(job_id).await?)
    }

    /// Fail every `running` record left by a previous process and rebuild the
    /// ready queue from `queued` records, oldest first.
    pub async fn recover(&self) -> JobResult<RecoveryReport> {
        let store = &self.inner.store;
        let mut report = RecoveryReport::default();

        for job_id in store.ids_with_status(JobStatus::Running).await? {
            match store.update(job_id, JobPatch::fail(INTERRUPTED_BY_RESTART)).await {
                Ok(_) => {
                    warn!(job_id = %job_id, "marked interrupted job as failed");
                    report.interrupted += 1;
                }
                Err(StoreError::Conflict { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let queued = store.ids_with_status(JobStatus::Queued).await?;
        {
            let mut ready = lock(&self.inner.ready);
            for job_id in queued {
                if !ready.contains(&job_id) {
                    ready.push_back(job_id);
                    report.requeued += 1;
                }
            }
        }
        self.inner.wake.notify_one();

        info!(
            interrupted = report.interrupted,
            requeued = report.requeued,
            "job recovery complete"
        );
        Ok(report)
    }

    /// Start the dispatch loop on the current tokio runtime.
    ///
    /// Dropping the returned handle also stops the loop.
    pub fn spawn(&self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let join = tokio::spawn(inner.dispatch_loop(shutdown_rx));

        SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            scheduler: self.clone(),
        }
    }

    /// Wait until no job holds a worker slot.
    async fn drain(&self) {
        let permits = u32::try_from(self.inner.max_workers).unwrap_or(u32::MAX);
        if let Ok(all) = self.inner.slots.acquire_many(permits).await {
            drop(all);
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("max_workers", &self.inner.max_workers)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Handle to control a running dispatch loop.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    scheduler: Scheduler,
}

impl SchedulerHandle {
    /// Stop dispatching and wait for jobs already running to finish.
    ///
    /// Jobs still waiting in the ready queue stay `queued` in the store.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(error = %err, "dispatch loop ended abnormally");
            }
        }
        self.scheduler.drain().await;
        info!("job scheduler stopped");
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }
}

impl Inner {
    async fn dispatch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(max_workers = self.max_workers, "job dispatch loop started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.ready_nonempty() => {}
            }

            // Ids leave the queue only once a slot is held, so `queue_depth`
            // and `dequeue` see every job that has not started.
            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = lock(&self.ready).pop_front();
            let Some(job_id) = next else {
                // Cancelled while we waited for the slot.
                continue;
            };

            let inner = self.clone();
            tokio::spawn(async move {
                if let Outcome::ClaimFailed(_) = inner.clone().run_job(job_id, permit).await {
                    inner.retry_later(job_id);
                }
            });
        }

        info!("job dispatch loop stopped");
    }

    async fn ready_nonempty(&self) {
        loop {
            let notified = self.wake.notified();
            let empty = lock(&self.ready).is_empty();
            if !empty {
                return;
            }
            notified.await;
        }
    }

    /// Put a job back at the head of the ready queue after a short delay.
    fn retry_later(self: &Arc<Self>, job_id: JobId) {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CLAIM_RETRY_DELAY).await;
            lock(&inner.ready).push_front(job_id);
            inner.wake.notify_one();
        });
    }

    async fn run_job(self: Arc<Self>, job_id: JobId, permit: OwnedSemaphorePermit) -> Outcome {
        let token = CancelToken::new();
        lock(&self.active).insert(job_id, token.clone());

        let outcome = self.execute(job_id, token).await;

        lock(&self.active).remove(&job_id);
        self.record(&outcome);
        drop(permit);
        outcome
    }

    async fn execute(&self, job_id: JobId, token: CancelToken) -> Outcome {
        let record = match self.store.update(job_id, JobPatch::start()).await {
            Ok(record) => record,
            Err(StoreError::Conflict { status, .. }) => {
                warn!(job_id = %job_id, status = %status, "skipping job that is no longer queued");
                return Outcome::Skipped;
            }
            Err(StoreError::NotFound(_)) => {
                warn!(job_id = %job_id, "skipping job that no longer exists");
                return Outcome::Skipped;
            }
            Err(err) => {
                error!(job_id = %job_id, error = %err, "failed to claim job");
                return Outcome::ClaimFailed(err);
            }
        };

        lock(&self.stats).current_running += 1;
        debug!(job_id = %job_id, kind = %record.kind, "claimed job");

        let result = match self.registry.resolve(&record.kind) {
            Ok(handler) => {
                let ctx = JobContext {
                    job_id,
                    kind: record.kind.clone(),
                    payload: record.request_payload,
                    correlation_id: record.correlation_id,
                    cancel: token.clone(),
                };
                tokio::task::spawn_blocking(move || handler.run(&ctx))
                    .await
                    .unwrap_or_else(|err| Err(HandlerError::Failed(join_failure(err))))
            }
            Err(_) => Err(HandlerError::Failed(format!(
                "no handler registered for job kind: {}",
                record.kind
            ))),
        };

        let patch = match result {
            _ if token.is_cancelled() => {
                JobPatch::cancel(CANCELLED_DURING_EXECUTION).only_from(&[JobStatus::Running])
            }
            Ok(value) => JobPatch::complete(value).or_cancel_if_requested(CANCELLED_DURING_EXECUTION),
            Err(HandlerError::Failed(msg)) => {
                warn!(job_id = %job_id, kind = %record.kind, error = %msg, "job handler failed");
                JobPatch::fail(msg).or_cancel_if_requested(CANCELLED_DURING_EXECUTION)
            }
            Err(HandlerError::Cancelled(note)) => {
                JobPatch::cancel(note).only_from(&[JobStatus::Running])
            }
        };

        let outcome = match self.store.update(job_id, patch).await {
            Ok(done) => {
                debug!(
                    job_id = %job_id,
                    kind = %done.kind,
                    status = %done.status,
                    duration_ms = done.duration_ms(),
                    "job finished"
                );
                Outcome::Finished(done.status)
            }
            Err(err) => {
                error!(job_id = %job_id, error = %err, "failed to persist job outcome");
                Outcome::Lost(err)
            }
        };

        let mut stats = lock(&self.stats);
        stats.current_running = stats.current_running.saturating_sub(1);
        outcome
    }

    fn record(&self, outcome: &Outcome) {
        let mut stats = lock(&self.stats);
        match outcome {
            Outcome::Skipped | Outcome::ClaimFailed(_) => return,
            Outcome::Finished(JobStatus::Completed) => stats.jobs_succeeded += 1,
            Outcome::Finished(JobStatus::Cancelled) => stats.jobs_cancelled += 1,
            Outcome::Finished(_) | Outcome::Lost(_) => stats.jobs_failed += 1,
        }
        stats.jobs_processed += 1;
    }
}

fn join_failure(err: JoinError) -> String {
    if !err.is_panic() {
        return "handler task was aborted".to_string();
    }
    let panic = err.into_panic();
    let msg = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("handler panicked: {msg}")
}

/// Lock a std mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
