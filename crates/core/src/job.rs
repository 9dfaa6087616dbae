//! Job record, lifecycle status and status summaries.

use core::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{JobError, JobResult};
use crate::id::JobId;

/// Current time truncated to microseconds, the precision every store keeps.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Lifecycle status of a job.
///
/// `queued → running → completed | failed | cancelled`, plus `queued → cancelled`.
/// The last three are terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub const TERMINAL: [JobStatus; 3] =
        [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Parse a comma-separated status list such as `"completed, failed"`.
    ///
    /// Blank entries are skipped and duplicates collapsed (first occurrence wins).
    pub fn parse_list(input: &str) -> JobResult<Vec<JobStatus>> {
        let mut out = Vec::new();
        let mut invalid = Vec::new();
        for raw in input.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            match raw.parse::<JobStatus>() {
                Ok(status) if !out.contains(&status) => out.push(status),
                Ok(_) => {}
                Err(_) => invalid.push(raw.to_string()),
            }
        }
        if !invalid.is_empty() {
            invalid.sort();
            invalid.dedup();
            return Err(JobError::validation(format!(
                "unsupported statuses: {}",
                invalid.join(", ")
            )));
        }
        Ok(out)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| JobError::validation(format!("unsupported status: {s}")))
    }
}

/// The persisted unit of work and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub kind: String,
    pub status: JobStatus,
    /// Submitted input, stored verbatim.
    pub request_payload: JsonValue,
    /// Handler output; only ever set on `completed`.
    pub result_payload: Option<JsonValue>,
    /// Failure text on `failed`, explanatory note on `cancelled`.
    pub error_text: Option<String>,
    pub cancel_requested: bool,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A fresh `queued` record with a newly generated id.
    pub fn queued(
        kind: impl Into<String>,
        request_payload: JsonValue,
        correlation_id: Option<String>,
    ) -> Self {
        let created_at = now();
        Self {
            job_id: JobId::new(),
            kind: kind.into(),
            status: JobStatus::Queued,
            request_payload,
            result_payload: None,
            error_text: None,
            cancel_requested: false,
            correlation_id,
            created_at,
            started_at: None,
            finished_at: None,
            updated_at: created_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall time of the job: execution time once finished, otherwise age
    /// since creation as of the last update.
    pub fn duration_ms(&self) -> u64 {
        let (start, end) = match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (start, end),
            _ => (self.created_at, self.updated_at),
        };
        (end - start).num_milliseconds().max(0) as u64
    }
}

/// Count of records per status. Always carries all five keys when serialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Queued => self.queued,
            JobStatus::Running => self.running,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    pub fn add(&mut self, status: JobStatus, n: u64) {
        let slot = match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Running => &mut self.running,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += n;
    }

    pub fn total(&self) -> u64 {
        JobStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}
