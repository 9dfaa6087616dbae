//! Handler registry: maps a job kind to the code that executes it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value as JsonValue;
use tracing::warn;

use studio_core::{JobError, JobId, JobResult};

/// Error returned by a handler. Always absorbed into the persisted record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// The task failed; the text becomes the record's `error_text`.
    #[error("{0}")]
    Failed(String),
    /// The handler stopped early after observing a cancellation request.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

/// Read-only view of a job's cancellation request.
///
/// Cloning shares the flag. Only the engine can trip it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `Err(HandlerError::Cancelled)` once cancellation was requested, for use
    /// with `?` between units of work.
    pub fn check(&self) -> Result<(), HandlerError> {
        if self.is_cancelled() {
            Err(HandlerError::Cancelled(
                "handler stopped after cancellation request".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Everything a handler receives for one execution.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub kind: String,
    pub payload: JsonValue,
    pub correlation_id: Option<String>,
    pub cancel: CancelToken,
}

/// Execution contract for one job kind.
///
/// `run` is synchronous and may block for a long time; the engine calls it on
/// the blocking thread pool.
pub trait JobHandler: Send + Sync + 'static {
    /// Reject malformed payloads at submission time, before anything is persisted.
    fn validate(&self, _payload: &JsonValue) -> Result<(), String> {
        Ok(())
    }

    fn run(&self, ctx: &JobContext) -> Result<JsonValue, HandlerError>;
}

/// Adapter for closures that ignore cancellation.
pub struct FnHandler<F>(F);

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&JsonValue, Option<&str>) -> Result<JsonValue, HandlerError> + Send + Sync + 'static,
{
    fn run(&self, ctx: &JobContext) -> Result<JsonValue, HandlerError> {
        (self.0)(&ctx.payload, ctx.correlation_id.as_deref())
    }
}

/// Adapter for closures that poll the cancel token.
pub struct CancellableFnHandler<F>(F);

impl<F> JobHandler for CancellableFnHandler<F>
where
    F: Fn(&JsonValue, Option<&str>, &CancelToken) -> Result<JsonValue, HandlerError>
        + Send
        + Sync
        + 'static,
{
    fn run(&self, ctx: &JobContext) -> Result<JsonValue, HandlerError> {
        (self.0)(&ctx.payload, ctx.correlation_id.as_deref(), &ctx.cancel)
    }
}

/// Static kind → handler table, built once at startup and shared by `Arc`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job kind, replacing any previous one.
    pub fn register<H: JobHandler>(&mut self, kind: impl Into<String>, handler: H) -> &mut Self {
        let kind = kind.into();
        if self.handlers.insert(kind.clone(), Arc::new(handler)).is_some() {
            warn!(kind = %kind, "replaced previously registered job handler");
        }
        self
    }

    /// Register a closure that runs to completion regardless of cancellation.
    pub fn register_fn<F>(&mut self, kind: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&JsonValue, Option<&str>) -> Result<JsonValue, HandlerError> + Send + Sync + 'static,
    {
        self.register(kind, FnHandler(f))
    }

    /// Register a closure that receives the job's cancel token.
    pub fn register_cancellable<F>(&mut self, kind: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&JsonValue, Option<&str>, &CancelToken) -> Result<JsonValue, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.register(kind, CancellableFnHandler(f))
    }

    /// Look up the handler for `kind`.
    pub fn resolve(&self, kind: &str) -> JobResult<Arc<dyn JobHandler>> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| JobError::validation(format!("unknown job kind: {kind}")))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
