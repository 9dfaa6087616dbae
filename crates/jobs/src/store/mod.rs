//! Durable job record storage.
//!
//! The store is the single source of truth for job state. Every mutation goes
//! through [`JobPatch::apply`], so both implementations enforce the same
//! lifecycle rules:
//!
//! - terminal records (`completed`, `failed`, `cancelled`) are never modified
//! - a patch may carry a status guard (`only_from`); a mismatch is a conflict
//! - `started_at` is stamped on entering `running`, `finished_at` on entering
//!   a terminal status
//! - `updated_at` strictly advances on every write

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use studio_core::{JobError, JobId, JobRecord, JobStatus, StatusCounts};

pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryJobStore;
pub use sqlite::SqliteJobStore;

/// Upper bound on the number of records a single `list` call returns.
pub const MAX_LIST_LIMIT: usize = 1000;

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record. Fails with `AlreadyExists` on id collision.
    async fn create(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// Apply a patch to one record atomically and return the updated record.
    async fn update(&self, job_id: JobId, patch: JobPatch) -> Result<JobRecord, StoreError>;

    /// Get a record by id.
    async fn get(&self, job_id: JobId) -> Result<JobRecord, StoreError>;

    /// Records ordered by `updated_at` descending (ties by id descending),
    /// truncated to `limit` (clamped to `1..=MAX_LIST_LIMIT`).
    ///
    /// `counts` always covers the whole table, regardless of `statuses`.
    /// `None` or an empty slice means no filter.
    async fn list(
        &self,
        statuses: Option<&[JobStatus]>,
        limit: usize,
    ) -> Result<JobListing, StoreError>;

    /// Count of records per status.
    async fn counts(&self) -> Result<StatusCounts, StoreError>;

    /// Delete every terminal record whose status is in `statuses`.
    ///
    /// Non-terminal statuses in the input are ignored. Returns the number of
    /// records removed.
    async fn delete_where(&self, statuses: &[JobStatus]) -> Result<u64, StoreError>;

    /// Ids with the given status, oldest first (`created_at`, then id).
    async fn ids_with_status(&self, status: JobStatus) -> Result<Vec<JobId>, StoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {job_id} is {status}")]
    Conflict { job_id: JobId, status: JobStatus },
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => JobError::NotFound(id),
            StoreError::AlreadyExists(id) => JobError::conflict(format!("job already exists: {id}")),
            StoreError::Conflict { job_id, status } => {
                JobError::conflict(format!("job {job_id} is already {status}"))
            }
            StoreError::Storage(msg) => JobError::Store(msg),
        }
    }
}

/// A page of records plus the unfiltered per-status summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobListing {
    pub jobs: Vec<JobRecord>,
    pub counts: StatusCounts,
}

/// Partial update of a single record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    /// Target status, if the patch transitions the record.
    pub status: Option<JobStatus>,
    /// Guard: the record's current status must be one of these.
    pub only_from: Option<Vec<JobStatus>>,
    /// Stored only when the target status is `completed`.
    pub result_payload: Option<JsonValue>,
    /// Stored only when the target status is `failed` or `cancelled`.
    pub error_text: Option<String>,
    pub cancel_requested: Option<bool>,
    /// Turns a `completed`/`failed` transition into `cancelled` with this note
    /// when the record already has `cancel_requested` set.
    pub cancel_note_if_requested: Option<String>,
}

impl JobPatch {
    /// `queued → running`.
    pub fn start() -> Self {
        Self {
            status: Some(JobStatus::Running),
            only_from: Some(vec![JobStatus::Queued]),
            ..Self::default()
        }
    }

    /// `running → completed` with the handler's result.
    pub fn complete(result: JsonValue) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            only_from: Some(vec![JobStatus::Running]),
            result_payload: Some(result),
            ..Self::default()
        }
    }

    /// `running → failed`.
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            only_from: Some(vec![JobStatus::Running]),
            error_text: Some(error.into()),
            ..Self::default()
        }
    }

    /// `queued | running → cancelled`, keeping `note` as the explanation.
    pub fn cancel(note: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Cancelled),
            only_from: Some(vec![JobStatus::Queued, JobStatus::Running]),
            error_text: Some(note.into()),
            ..Self::default()
        }
    }

    /// Flag a running job for cooperative cancellation without changing status.
    pub fn request_cancel() -> Self {
        Self {
            only_from: Some(vec![JobStatus::Running]),
            cancel_requested: Some(true),
            ..Self::default()
        }
    }

    /// Replace the status guard.
    pub fn only_from(mut self, statuses: &[JobStatus]) -> Self {
        self.only_from = Some(statuses.to_vec());
        self
    }

    /// Let a pending cancellation request override this completion.
    pub fn or_cancel_if_requested(mut self, note: impl Into<String>) -> Self {
        self.cancel_note_if_requested = Some(note.into());
        self
    }

    /// Also set `cancel_requested`.
    pub fn mark_cancel_requested(mut self) -> Self {
        self.cancel_requested = Some(true);
        self
    }

    /// Apply the patch in place, enforcing the lifecycle rules.
    ///
    /// On error the record is left untouched.
    pub fn apply(&self, record: &mut JobRecord, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conflict = StoreError::Conflict {
            job_id: record.job_id,
            status: record.status,
        };

        if record.is_terminal() {
            return Err(conflict);
        }
        if let Some(allowed) = &self.only_from {
            if !allowed.contains(&record.status) {
                return Err(conflict);
            }
        }
        if let Some(next) = self.status {
            if !transition_allowed(record.status, next) {
                return Err(conflict);
            }
        }

        let updated_at = next_timestamp(record.updated_at, now);

        if let Some(flag) = self.cancel_requested {
            record.cancel_requested = flag;
        }

        let mut error_text = self.error_text.clone();
        let mut target = self.status;
        if let (Some(JobStatus::Completed | JobStatus::Failed), Some(note)) =
            (target, &self.cancel_note_if_requested)
        {
            if record.cancel_requested {
                target = Some(JobStatus::Cancelled);
                error_text = Some(note.clone());
            }
        }

        if let Some(next) = target {
            record.status = next;
            if next == JobStatus::Running {
                record.started_at = Some(updated_at);
            }
            if next.is_terminal() {
                record.finished_at = Some(updated_at);
                if next == JobStatus::Completed {
                    record.result_payload = self.result_payload.clone();
                    record.error_text = None;
                } else {
                    record.result_payload = None;
                    record.error_text = error_text;
                }
            }
        }

        record.updated_at = updated_at;
        Ok(())
    }
}

fn transition_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Queued, Running)
            | (Queued, Cancelled)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
    )
}

/// `now`, or one microsecond past `previous` if the clock has not advanced.
fn next_timestamp(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > previous {
        now
    } else {
        previous + chrono::Duration::microseconds(1)
    }
}

pub(crate) fn clamp_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_LIST_LIMIT)
}

/// Deduplicated terminal subset of `statuses`.
pub(crate) fn terminal_only(statuses: &[JobStatus]) -> Vec<JobStatus> {
    let mut out = Vec::new();
    for status in statuses {
        if status.is_terminal() && !out.contains(status) {
            out.push(*status);
        }
    }
    out
}

/// `None` for a missing or empty filter.
pub(crate) fn effective_filter(statuses: Option<&[JobStatus]>) -> Option<&[JobStatus]> {
    statuses.filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use studio_core::now;

    fn queued() -> JobRecord {
        JobRecord::queued("test", serde_json::json!({"n": 1}), None)
    }

    #[test]
    fn start_then_complete_stamps_timestamps() {
        let mut record = queued();

        JobPatch::start().apply(&mut record, now()).unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.started_at, Some(record.updated_at));
        assert!(record.finished_at.is_none());

        JobPatch::complete(serde_json::json!({"ok": true}))
            .apply(&mut record, now())
            .unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.result_payload, Some(serde_json::json!({"ok": true})));
        assert!(record.error_text.is_none());
        assert_eq!(record.finished_at, Some(record.updated_at));
    }

    #[test]
    fn terminal_records_reject_every_patch() {
        let mut record = queued();
        JobPatch::cancel("stop").apply(&mut record, now()).unwrap();
        let snapshot = record.clone();

        for patch in [
            JobPatch::start(),
            JobPatch::complete(serde_json::json!(1)),
            JobPatch::fail("boom"),
            JobPatch::cancel("again"),
            JobPatch::request_cancel(),
            JobPatch::default(),
        ] {
            let err = patch.apply(&mut record, now()).unwrap_err();
            assert_eq!(
                err,
                StoreError::Conflict {
                    job_id: record.job_id,
                    status: JobStatus::Cancelled
                }
            );
        }
        assert_eq!(record, snapshot);
    }

    #[test]
    fn guard_mismatch_is_a_conflict() {
        let mut record = queued();
        let err = JobPatch::complete(serde_json::json!({}))
            .apply(&mut record, now())
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { status: JobStatus::Queued, .. }));
        assert_eq!(record.status, JobStatus::Queued);
    }

    #[test]
    fn cancelled_drops_result_and_keeps_note() {
        let mut record = queued();
        JobPatch::start().apply(&mut record, now()).unwrap();
        let mut patch = JobPatch::cancel("Cancelled by user during execution.");
        patch.result_payload = Some(serde_json::json!({"late": true}));
        patch.apply(&mut record, now()).unwrap();

        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(record.result_payload.is_none());
        assert_eq!(
            record.error_text.as_deref(),
            Some("Cancelled by user during execution.")
        );
    }

    #[test]
    fn pending_cancel_request_overrides_completion() {
        let mut record = queued();
        JobPatch::start().apply(&mut record, now()).unwrap();
        JobPatch::request_cancel().apply(&mut record, now()).unwrap();

        JobPatch::complete(serde_json::json!({"ok": true}))
            .or_cancel_if_requested("stopped")
            .apply(&mut record, now())
            .unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(record.result_payload.is_none());
        assert_eq!(record.error_text.as_deref(), Some("stopped"));
    }

    #[test]
    fn override_is_inert_without_a_request() {
        let mut record = queued();
        JobPatch::start().apply(&mut record, now()).unwrap();
        JobPatch::fail("boom")
            .or_cancel_if_requested("stopped")
            .apply(&mut record, now())
            .unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error_text.as_deref(), Some("boom"));
    }

    #[test]
    fn updated_at_advances_even_with_a_stalled_clock() {
        let mut record = queued();
        let frozen = record.updated_at;
        JobPatch::start().apply(&mut record, frozen).unwrap();
        assert!(record.updated_at > frozen);
        let after_start = record.updated_at;
        JobPatch::request_cancel().apply(&mut record, frozen).unwrap();
        assert!(record.updated_at > after_start);
        assert!(record.cancel_requested);
    }

    #[test]
    fn terminal_only_filters_and_dedups() {
        let out = terminal_only(&[
            JobStatus::Running,
            JobStatus::Failed,
            JobStatus::Queued,
            JobStatus::Failed,
            JobStatus::Completed,
        ]);
        assert_eq!(out, vec![JobStatus::Failed, JobStatus::Completed]);
    }

    #[test]
    fn store_errors_map_to_job_errors() {
        let id = JobId::new();
        assert_eq!(JobError::from(StoreError::NotFound(id)), JobError::NotFound(id));
        assert!(matches!(
            JobError::from(StoreError::AlreadyExists(id)),
            JobError::Conflict(_)
        ));
        assert_eq!(
            JobError::from(StoreError::Storage("disk full".into())),
            JobError::Store("disk full".into())
        );
    }

    fn any_patch() -> impl Strategy<Value = JobPatch> {
        prop_oneof![
            Just(JobPatch::start()),
            Just(JobPatch::complete(serde_json::json!({"r": 1}))),
            Just(JobPatch::fail("err")),
            Just(JobPatch::cancel("note")),
            Just(JobPatch::request_cancel()),
            Just(JobPatch::start().only_from(&JobStatus::ALL)),
        ]
    }

    fn rank(status: JobStatus) -> u8 {
        match status {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            _ => 2,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: any sequence of patches moves status forward only, keeps
        /// result/error exclusive, and freezes the record once terminal.
        #[test]
        fn lifecycle_is_monotonic(patches in prop::collection::vec(any_patch(), 1..12)) {
            let mut record = queued();
            for patch in patches {
                let before = record.clone();
                let applied = patch.apply(&mut record, now()).is_ok();

                prop_assert!(rank(record.status) >= rank(before.status));
                prop_assert!(!(record.result_payload.is_some() && record.error_text.is_some()));
                if !record.is_terminal() {
                    prop_assert!(record.result_payload.is_none());
                    prop_assert!(record.error_text.is_none());
                }
                if before.is_terminal() {
                    prop_assert!(!applied);
                    prop_assert_eq!(&record, &before);
                }
                if applied {
                    prop_assert!(record.updated_at > before.updated_at);
                }
            }
        }
    }
}
