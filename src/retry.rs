//! Retry scheduling and the morgue.
//!
//! [`RetryMiddleware`] wraps the handler dispatch. On a handler failure it
//! rewrites the job's failure bookkeeping, then either schedules the job
//! into the `retry` sorted set with exponential backoff or moves it to the
//! `dead` sorted set, and always re-raises the original failure so the
//! outer logger still observes it.
//!
//! Backoff is `count^4 + 15 + rand(30) * (count + 1)` seconds. The random
//! component is injectable so scheduling is deterministic under test. Redis
//! scores are fractional epoch seconds formatted with six decimal places.
//!
//! A separate poller promotes due entries from `retry` back onto their
//! queues; this module only writes the sets.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tracing::{debug, info};

use crate::handler::HandlerError;
use crate::job::Job;
use crate::middleware::{JobContext, Next, ProcessError, ServerMiddleware};
use crate::pool::RedisPool;

/// Sorted set of jobs awaiting re-execution, scored by eligibility time.
const RETRY_SET: &str = "retry";

/// Sorted set of exhausted jobs, scored by time of death.
const DEAD_SET: &str = "dead";

/// The morgue keeps at most this many entries.
const DEAD_MAX_JOBS: i64 = 10_000;

/// Morgue entries older than six months are pruned.
const DEAD_TIMEOUT_SECS: f64 = 180.0 * 24.0 * 60.0 * 60.0;

/// Source of the random backoff component: returns a uniform integer in
/// `[0, bound)`.
pub type Jitter = Arc<dyn Fn(u32) -> u32 + Send + Sync>;

/// What to do with a job after its failure has been recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Disposition {
    /// Schedule into the retry set, eligible at this epoch time.
    Retry { at: f64 },
    /// Retries exhausted; move to the morgue.
    Kill,
    /// Nothing to persist: retries disabled, or death suppressed.
    Discard,
}

/// Current time as fractional epoch seconds.
fn epoch_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Seconds until attempt `count + 1` becomes eligible.
fn delay_for(count: u32, jitter: &dyn Fn(u32) -> u32) -> u64 {
    let count = count as u64;
    count.pow(4) + 15 + u64::from(jitter(30)) * (count + 1)
}

/// Applies the failure to the job's bookkeeping fields and decides its
/// fate.
///
/// With retries disabled (`max == 0`) the job is left completely
/// untouched. Otherwise the error summary is recorded, `failed_at` is set
/// on the very first failure and `retried_at` on every later one, the
/// backtrace is captured up to the job's limit, and the attempt counter
/// decides between scheduling and the morgue.
fn record_failure(
    job: &mut Job,
    err: &HandlerError,
    now: f64,
    jitter: &dyn Fn(u32) -> u32,
) -> Disposition {
    let max = job.max_retries();
    if max == 0 {
        return Disposition::Discard;
    }

    job.error_message = Some(err.message().to_string());
    job.error_class = Some(err.class_name().to_string());

    let count = match job.retry_count {
        None => {
            job.failed_at = Some(now);
            job.retry_count = Some(0);
            0
        }
        Some(previous) => {
            job.retried_at = Some(now);
            let count = previous + 1;
            job.retry_count = Some(count);
            count
        }
    };

    let frame_limit = job.backtrace_limit();
    if frame_limit > 0 {
        job.error_backtrace = Some(err.backtrace().iter().take(frame_limit).cloned().collect());
    }

    if count < max {
        Disposition::Retry {
            at: now + delay_for(count, jitter) as f64,
        }
    } else if job.death_suppressed() {
        Disposition::Discard
    } else {
        Disposition::Kill
    }
}

/// Chain entry that turns handler failures into retry or morgue writes.
pub struct RetryMiddleware {
    pool: Arc<RedisPool>,
    jitter: Jitter,
}

impl RetryMiddleware {
    /// Creates the entry with the default random backoff component.
    pub fn new(pool: Arc<RedisPool>) -> Self {
        Self {
            pool,
            jitter: Arc::new(|bound| rand::rng().random_range(0..bound)),
        }
    }

    /// Replaces the random component, for deterministic scheduling.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    async fn persist_failure(&self, job: &mut Job, err: &HandlerError) -> Result<(), ProcessError> {
        let now = epoch_now();
        match record_failure(job, err, now, self.jitter.as_ref()) {
            Disposition::Retry { at } => self.schedule_retry(job, at).await,
            Disposition::Kill => self.send_to_morgue(job, now).await,
            Disposition::Discard => Ok(()),
        }
    }

    async fn schedule_retry(&self, job: &Job, at: f64) -> Result<(), ProcessError> {
        let payload = job.encode()?;
        debug!(
            jid = %job.jid,
            retry_count = job.retry_count.unwrap_or(0),
            retry_at = at,
            "Scheduling retry"
        );

        let mut conn = self.pool.get().await?;
        redis::cmd("ZADD")
            .arg(RETRY_SET)
            .arg(format!("{at:.6}"))
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Adds the job to the dead set and prunes it by age and size, all in
    /// one transaction. The age prune uses an exclusive upper bound.
    async fn send_to_morgue(&self, job: &Job, now: f64) -> Result<(), ProcessError> {
        let payload = job.encode()?;
        info!(jid = %job.jid, class = %job.klass, "Adding dead job");

        let mut conn = self.pool.get().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZADD")
            .arg(DEAD_SET)
            .arg(format!("{now:.6}"))
            .arg(&payload)
            .ignore()
            .cmd("ZREMRANGEBYSCORE")
            .arg(DEAD_SET)
            .arg("-inf")
            .arg(format!("({:.6}", now - DEAD_TIMEOUT_SECS))
            .ignore()
            .cmd("ZREMRANGEBYRANK")
            .arg(DEAD_SET)
            .arg(0)
            .arg(-DEAD_MAX_JOBS)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl ServerMiddleware for RetryMiddleware {
    fn name(&self) -> &str {
        "Retry"
    }

    async fn call(
        &self,
        job: &mut Job,
        ctx: &JobContext,
        next: Next<'_>,
    ) -> Result<(), ProcessError> {
        match next.run(job, ctx).await {
            Ok(()) => Ok(()),
            Err(ProcessError::Failed(err)) => {
                // Redis/encoding errors from the write abort the re-raise
                // and surface as infrastructure failures instead.
                self.persist_failure(job, &err).await?;
                Err(ProcessError::Failed(err))
            }
            Err(infrastructure) => Err(infrastructure),
        }
    }
}
