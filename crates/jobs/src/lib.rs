//! `studio-jobs`: background job engine.
//!
//! Jobs are submitted through [`JobService`], persisted by a [`JobStore`] and
//! executed by handlers looked up in a [`HandlerRegistry`]. [`JobEngine`] wires
//! the pieces together over SQLite and recovers state left by a previous run.

pub mod config;
pub mod engine;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod store;

pub use config::JobEngineConfig;
pub use engine::JobEngine;
pub use registry::{CancelToken, HandlerError, HandlerRegistry, JobContext, JobHandler};
pub use scheduler::{RecoveryReport, Scheduler, SchedulerHandle, SchedulerStats};
pub use service::{
    CancelOutcome, ClearOutcome, JobService, ListQuery, SubmitOutcome, SubmitRequest,
};
pub use store::{InMemoryJobStore, JobListing, JobPatch, JobStore, SqliteJobStore, StoreError};

pub use studio_core::{JobError, JobId, JobRecord, JobResult, JobStatus, StatusCounts};
