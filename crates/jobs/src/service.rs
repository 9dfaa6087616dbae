//! Job service: the operations exposed to the control plane.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument};

use studio_core::{JobError, JobId, JobRecord, JobResult, JobStatus, StatusCounts};

use crate::registry::HandlerRegistry;
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::store::{JobListing, JobPatch, JobStore, StoreError, terminal_only};

/// Note stored on a queued job cancelled by the user.
pub const CANCELLED_BEFORE_EXECUTION: &str = "Cancelled by user before execution.";

/// Limit used by `list` when the query does not carry one.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Request to run a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub kind: String,
    #[serde(default = "empty_object")]
    pub payload: JsonValue,
    /// Return right after enqueueing instead of waiting for the result.
    #[serde(default)]
    pub async_mode: bool,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

fn empty_object() -> JsonValue {
    JsonValue::Object(Default::default())
}

impl SubmitRequest {
    /// A synchronous request.
    pub fn new(kind: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            kind: kind.into(),
            payload,
            async_mode: false,
            correlation_id: None,
        }
    }

    pub fn in_background(mut self) -> Self {
        self.async_mode = true;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Reply to `submit`: the terminal state for synchronous jobs, `queued` otherwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitOutcome {
    pub job_id: JobId,
    pub status: JobStatus,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
}

impl From<&JobRecord> for SubmitOutcome {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id,
            status: record.status,
            result: record.result_payload.clone(),
            error: record.error_text.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub statuses: Option<Vec<JobStatus>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn with_statuses(mut self, statuses: &[JobStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    pub job_id: JobId,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClearOutcome {
    pub deleted: u64,
    /// Terminal statuses that were actually cleared.
    pub statuses: Vec<JobStatus>,
    /// Per-status totals after the delete.
    pub counts: StatusCounts,
}

/// Facade over the store, the registry and the scheduler.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    scheduler: Scheduler,
    default_list_limit: usize,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            store,
            registry,
            scheduler,
            default_list_limit: DEFAULT_LIST_LIMIT,
        }
    }

    pub fn with_default_list_limit(mut self, limit: usize) -> Self {
        self.default_list_limit = limit;
        self
    }

    /// Validate and persist a new job, then either enqueue it or run it to
    /// completion on the caller's behalf.
    ///
    /// Nothing is persisted when validation fails.
    #[instrument(skip(self, request), fields(kind = %request.kind, async_mode = request.async_mode), err)]
    pub async fn submit(&self, request: SubmitRequest) -> JobResult<SubmitOutcome> {
        let kind = request.kind.trim();
        if kind.is_empty() {
            return Err(JobError::validation("job kind must not be empty"));
        }
        let handler = self.registry.resolve(kind)?;

        if !request.payload.is_object() {
            return Err(JobError::validation("payload must be a JSON object"));
        }
        handler
            .validate(&request.payload)
            .map_err(|msg| JobError::validation(format!("invalid payload for {kind}: {msg}")))?;

        let correlation_id = request.correlation_id.filter(|c| !c.trim().is_empty());
        let record = JobRecord::queued(kind, request.payload, correlation_id);
        self.store.create(&record).await?;
        debug!(job_id = %record.job_id, kind = %record.kind, "job submitted");

        if request.async_mode {
            self.scheduler.enqueue(record.job_id);
            return Ok(SubmitOutcome::from(&record));
        }

        let done = self.scheduler.run_inline(record.job_id).await?;
        Ok(SubmitOutcome::from(&done))
    }

    pub async fn get(&self, job_id: JobId) -> JobResult<JobRecord> {
        Ok(self.store.get(job_id).await?)
    }

    /// Most recently updated first, with whole-table counts.
    pub async fn list(&self, query: ListQuery) -> JobResult<JobListing> {
        let limit = query.limit.unwrap_or(self.default_list_limit);
        Ok(self.store.list(query.statuses.as_deref(), limit).await?)
    }

    pub async fn counts(&self) -> JobResult<StatusCounts> {
        Ok(self.store.counts().await?)
    }

    /// Cancel a queued job outright, or ask a running one to stop.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, job_id: JobId) -> JobResult<CancelOutcome> {
        let record = self.store.get(job_id).await?;

        if record.status == JobStatus::Queued {
            let patch = JobPatch::cancel(CANCELLED_BEFORE_EXECUTION)
                .only_from(&[JobStatus::Queued])
                .mark_cancel_requested();
            match self.store.update(job_id, patch).await {
                Ok(done) => {
                    self.scheduler.dequeue(job_id);
                    info!(job_id = %job_id, "cancelled queued job");
                    return Ok(CancelOutcome {
                        job_id,
                        status: done.status,
                        message: "Job cancelled.".to_string(),
                    });
                }
                // The dispatcher claimed it in the meantime.
                Err(StoreError::Conflict {
                    status: JobStatus::Running,
                    ..
                }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let flagged = self.store.update(job_id, JobPatch::request_cancel()).await?;
        self.scheduler.signal_cancel(job_id);
        info!(job_id = %job_id, "cancellation requested for running job");
        Ok(CancelOutcome {
            job_id,
            status: flagged.status,
            message: "Cancellation requested for running job.".to_string(),
        })
    }

    /// Delete terminal records. `None` clears every terminal status.
    #[instrument(skip(self), err)]
    pub async fn clear(&self, statuses: Option<Vec<JobStatus>>) -> JobResult<ClearOutcome> {
        let requested = match statuses {
            None => JobStatus::TERMINAL.to_vec(),
            Some(statuses) if statuses.is_empty() => {
                return Err(JobError::validation(
                    "at least one status is required to clear jobs",
                ));
            }
            Some(statuses) => statuses,
        };

        let targets = terminal_only(&requested);
        let deleted = if targets.is_empty() {
            0
        } else {
            self.store.delete_where(&targets).await?
        };
        let counts = self.store.counts().await?;
        info!(deleted, "cleared finished jobs");

        Ok(ClearOutcome {
            deleted,
            statuses: targets,
            counts,
        })
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Registered job kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        self.registry.kinds().into_iter().map(str::to_string).collect()
    }
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService")
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler)
            .field("default_list_limit", &self.default_list_limit)
            .finish()
    }
}
