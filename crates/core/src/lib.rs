//! `studio-core`: job engine domain building blocks.
//!
//! This crate contains **pure domain** primitives (no persistence, no runtime).

pub mod error;
pub mod id;
pub mod job;

pub use error::{JobError, JobResult};
pub use id::JobId;
pub use job::{JobRecord, JobStatus, StatusCounts, now};
