//! Queue fetch: blocking pop across prioritized Redis lists.
//!
//! A [`Fetcher`] issues one BRPOP over the configured queues in priority
//! order and hands the popped payload back as a [`UnitOfWork`]. The
//! shutdown flag is sampled at every blocking boundary: once stop has been
//! requested an idle fetch returns `None` immediately, but a payload that
//! was already popped is always returned so the processor can finish or
//! requeue it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::pool::RedisPool;

/// Redis key prefix for queue lists.
const QUEUE_PREFIX: &str = "queue:";

/// Errors that can occur while fetching work.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The blocking pop (or connection checkout) failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),
}

/// One payload popped from a queue, together with its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOfWork {
    /// Queue name without the `queue:` prefix.
    pub queue: String,
    /// Raw JSON payload exactly as the producer wrote it.
    pub payload: String,
}

impl UnitOfWork {
    /// Redis key of the source queue.
    pub fn queue_key(&self) -> String {
        format!("{QUEUE_PREFIX}{}", self.queue)
    }

    /// Pushes the untouched payload back onto its source queue.
    ///
    /// Used when a processor dies with the job still in flight; RPUSH puts
    /// the payload back at the consuming end so it is retried next.
    pub(crate) async fn requeue(&self, pool: &RedisPool) -> Result<(), redis::RedisError> {
        let mut conn = pool.get().await?;
        redis::cmd("RPUSH")
            .arg(self.queue_key())
            .arg(&self.payload)
            .query_async::<_, ()>(&mut conn)
            .await
    }
}

/// Pulls payloads from an ordered list of queues.
pub struct Fetcher {
    pool: Arc<RedisPool>,
    keys: Vec<String>,
    timeout: Duration,
    stopping: Arc<AtomicBool>,
}

impl Fetcher {
    /// Creates a fetcher over `queues` in priority order.
    pub fn new(
        pool: Arc<RedisPool>,
        queues: &[String],
        timeout: Duration,
        stopping: Arc<AtomicBool>,
    ) -> Self {
        let keys = queues
            .iter()
            .map(|queue| format!("{QUEUE_PREFIX}{queue}"))
            .collect();
        Self {
            pool,
            keys,
            timeout,
            stopping,
        }
    }

    /// Blocks for the next available payload.
    ///
    /// Returns `Ok(None)` when the timeout expires with no work, or
    /// immediately when shutdown has been requested and nothing was
    /// popped. A payload popped before the shutdown check is still
    /// returned; it is never dropped.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Redis`] when the pop itself fails; the caller
    /// treats this as an involuntary processor death.
    pub async fn fetch(&self) -> Result<Option<UnitOfWork>, FetchError> {
        if self.stopping.load(Ordering::Relaxed) {
            return Ok(None);
        }

        let mut conn = self.pool.get().await?;
        let timeout_secs = self.timeout.as_secs().max(1) as usize;

        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&self.keys)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        Ok(popped.map(|(key, payload)| UnitOfWork {
            queue: key
                .strip_prefix(QUEUE_PREFIX)
                .unwrap_or(key.as_str())
                .to_string(),
            payload,
        }))
    }
}
