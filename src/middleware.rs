//! Middleware chain composed around every job execution.
//!
//! Entries wrap the handler in order: the first entry added runs outermost
//! and sees completion, failure, and anything inner entries re-raise. The
//! innermost entry of the default server chain is the handler dispatcher,
//! so a freshly built server always carries three entries: the job logger,
//! the retry handler, and dispatch.
//!
//! The chain is assembled before the server starts and shared read-only
//! across processors afterwards.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info};

use crate::handler::HandlerError;
use crate::job::Job;

/// Error surfaced by the middleware pipeline.
///
/// `Failed` carries a handler failure that the retry middleware records and
/// re-raises; the remaining variants are infrastructure failures that must
/// reach the processor so it can report an involuntary death.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The handler (or dispatch) failed; retryable.
    #[error("{0}")]
    Failed(#[from] HandlerError),

    /// A Redis write inside the pipeline failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Re-encoding the job for a Redis write failed.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Per-execution context handed to every chain entry and handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    queue: String,
}

impl JobContext {
    /// Creates a context for a job fetched from `queue`.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    /// Queue the job was fetched from.
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

/// One entry in the server middleware chain.
///
/// An entry runs its body, then either calls `next.run(..)` to continue
/// toward the handler or short-circuits. Errors returned by inner entries
/// propagate back out through each `call`, so an entry may observe and
/// re-raise them.
#[async_trait]
pub trait ServerMiddleware: Send + Sync {
    /// Stable name used by [`MiddlewareChain::remove`] predicates and logs.
    fn name(&self) -> &str;

    /// Whether this entry performs the handler dispatch itself instead of
    /// calling its continuation. A terminal entry stays innermost:
    /// [`MiddlewareChain::add`] inserts new entries before it so they
    /// still wrap the handler.
    fn terminal(&self) -> bool {
        false
    }

    /// Wraps the rest of the chain around one job execution.
    async fn call(
        &self,
        job: &mut Job,
        ctx: &JobContext,
        next: Next<'_>,
    ) -> Result<(), ProcessError>;
}

/// Continuation representing the remaining entries of the chain.
pub struct Next<'a> {
    entries: &'a [Arc<dyn ServerMiddleware>],
}

impl<'a> Next<'a> {
    /// Runs the remaining entries in order.
    ///
    /// An exhausted continuation is a no-op; the innermost entry of a
    /// server chain performs the actual handler dispatch and does not call
    /// its continuation.
    pub async fn run(self, job: &mut Job, ctx: &JobContext) -> Result<(), ProcessError> {
        match self.entries.split_first() {
            Some((entry, rest)) => entry.call(job, ctx, Next { entries: rest }).await,
            None => Ok(()),
        }
    }
}

/// Ordered collection of middleware entries.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    entries: Vec<Arc<dyn ServerMiddleware>>,
}

impl MiddlewareChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry; it runs inside all existing non-terminal entries
    /// but still outside the dispatch terminal, so added middleware wraps
    /// the handler.
    pub fn add(&mut self, entry: Arc<dyn ServerMiddleware>) {
        let position = self
            .entries
            .iter()
            .position(|existing| existing.terminal())
            .unwrap_or(self.entries.len());
        self.entries.insert(position, entry);
    }

    /// Prepends an entry; it runs outside all existing entries.
    pub fn prepend(&mut self, entry: Arc<dyn ServerMiddleware>) {
        self.entries.insert(0, entry);
    }

    /// Removes every entry matching `predicate`, returning how many were
    /// dropped.
    pub fn remove<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&dyn ServerMiddleware) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|entry| !predicate(entry.as_ref()));
        before - self.entries.len()
    }

    /// Current entries, outermost first.
    pub fn entries(&self) -> &[Arc<dyn ServerMiddleware>] {
        &self.entries
    }

    /// Composes all entries around the innermost one and executes the job.
    pub async fn invoke(&self, job: &mut Job, ctx: &JobContext) -> Result<(), ProcessError> {
        Next {
            entries: &self.entries,
        }
        .run(job, ctx)
        .await
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| entry.name()))
            .finish()
    }
}

/// Default outermost entry: logs start, completion, and failure of every
/// job with its elapsed time.
#[derive(Debug, Default)]
pub struct JobLogger;

impl JobLogger {
    /// Creates the logger entry.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ServerMiddleware for JobLogger {
    fn name(&self) -> &str {
        "JobLogger"
    }

    async fn call(
        &self,
        job: &mut Job,
        ctx: &JobContext,
        next: Next<'_>,
    ) -> Result<(), ProcessError> {
        let start = Instant::now();
        info!(jid = %job.jid, class = %job.klass, queue = %ctx.queue(), "start");

        match next.run(job, ctx).await {
            Ok(()) => {
                info!(
                    jid = %job.jid,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "done"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    jid = %job.jid,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    error = %e,
                    "fail"
                );
                Err(e)
            }
        }
    }
}
