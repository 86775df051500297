//! Processors: one concurrent job executor each.
//!
//! A processor loops fetch, decode, invoke until shutdown. Handler
//! failures are absorbed by the middleware chain and never end the loop;
//! infrastructure failures and panics end it with a `Died` notification so
//! the controller can decide on a replacement. The lightweight [`Processor`]
//! handle is what the controller tracks; the running state lives inside
//! the spawned task.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::fetch::{Fetcher, UnitOfWork};
use crate::job::Job;
use crate::middleware::{JobContext, MiddlewareChain, ProcessError};
use crate::pool::RedisPool;
use crate::server::SharedStats;

/// Identity of one processor, tracked by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Processor {
    id: Uuid,
}

impl Processor {
    pub(crate) fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    /// Unique id of this processor.
    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Notification sent from a processor task to the supervisory loop.
#[derive(Debug)]
pub(crate) enum ProcessorEvent {
    /// Voluntary exit after a shutdown request.
    Stopped(Processor),
    /// Involuntary exit; carries the cause.
    Died(Processor, String),
}

/// The running half of a processor, executed as its own task.
pub(crate) struct ProcessorTask {
    pub(crate) handle: Processor,
    pub(crate) fetcher: Fetcher,
    pub(crate) chain: Arc<MiddlewareChain>,
    pub(crate) pool: Arc<RedisPool>,
    pub(crate) stopping: Arc<AtomicBool>,
    pub(crate) events: mpsc::UnboundedSender<ProcessorEvent>,
    pub(crate) stats: Arc<SharedStats>,
}

impl ProcessorTask {
    /// Main loop: fetch and execute until shutdown or death.
    pub(crate) async fn run(self) {
        debug!(processor_id = %self.handle.id, "Processor started");

        loop {
            if self.stopping.load(Ordering::Relaxed) {
                break;
            }

            match self.fetcher.fetch().await {
                Ok(Some(work)) => {
                    if let Err(cause) = self.process_one(work).await {
                        error!(processor_id = %self.handle.id, cause = %cause, "Processor died");
                        let _ = self
                            .events
                            .send(ProcessorEvent::Died(self.handle.clone(), cause));
                        return;
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    error!(processor_id = %self.handle.id, error = %e, "Processor died");
                    let _ = self
                        .events
                        .send(ProcessorEvent::Died(self.handle.clone(), e.to_string()));
                    return;
                }
            }
        }

        debug!(processor_id = %self.handle.id, "Processor stopped");
        let _ = self.events.send(ProcessorEvent::Stopped(self.handle.clone()));
    }

    /// Executes one fetched payload to completion.
    ///
    /// Returns `Err` only for failures the middleware chain could not
    /// absorb; the error string becomes the death cause. The in-flight
    /// payload is pushed back onto its queue first so it is not lost.
    async fn process_one(&self, work: UnitOfWork) -> Result<(), String> {
        let mut job = match Job::decode(&work.payload) {
            Ok(job) => job,
            Err(e) => {
                // Malformed payloads are already off the queue; nothing to
                // retry, so log and move on.
                error!(queue = %work.queue, error = %e, "Discarding malformed job payload");
                return Ok(());
            }
        };

        let ctx = JobContext::new(work.queue.clone());
        let invoked = AssertUnwindSafe(self.chain.invoke(&mut job, &ctx))
            .catch_unwind()
            .await;

        match invoked {
            Ok(Ok(())) => {
                self.stats.record_success();
                Ok(())
            }
            Ok(Err(ProcessError::Failed(_))) => {
                // Recorded and logged by the chain; the processor keeps
                // going.
                self.stats.record_failure();
                Ok(())
            }
            Ok(Err(infrastructure)) => {
                self.stats.record_failure();
                self.requeue_in_flight(&work).await;
                Err(infrastructure.to_string())
            }
            Err(panic) => {
                self.stats.record_failure();
                self.requeue_in_flight(&work).await;
                Err(format!("job execution panicked: {}", panic_message(&panic)))
            }
        }
    }

    async fn requeue_in_flight(&self, work: &UnitOfWork) {
        if let Err(e) = work.requeue(&self.pool).await {
            error!(queue = %work.queue, error = %e, "Failed to requeue in-flight job");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::handler::{HandlerDispatch, HandlerError, HandlerRegistry, JobArgs, JobHandler};
    use crate::retry::RetryMiddleware;
    use async_trait::async_trait;
    use std::time::Duration;

    fn task_with_chain(chain: MiddlewareChain) -> (ProcessorTask, mpsc::UnboundedReceiver<ProcessorEvent>) {
        let pool = Arc::new(RedisPool::new("redis://127.0.0.1:1"));
        let stopping = Arc::new(AtomicBool::new(false));
        let config = ServerConfig::default();
        let (tx, rx) = mpsc::unbounded_channel();

        let task = ProcessorTask {
            handle: Processor::new(),
            fetcher: Fetcher::new(
                Arc::clone(&pool),
                &config.queues,
                Duration::from_secs(1),
                Arc::clone(&stopping),
            ),
            chain: Arc::new(chain),
            pool,
            stopping,
            events: tx,
            stats: Arc::new(SharedStats::new()),
        };
        (task, rx)
    }

    struct PanickyHandler;

    #[async_trait]
    impl JobHandler for PanickyHandler {
        async fn perform(&self, _args: JobArgs<'_>, _ctx: &JobContext) -> Result<(), HandlerError> {
            panic!("handler bug");
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl JobHandler for FailingHandler {
        async fn perform(&self, _args: JobArgs<'_>, _ctx: &JobContext) -> Result<(), HandlerError> {
            Err(HandlerError::new("RuntimeError", "boom"))
        }
    }

    #[tokio::test]
    async fn test_malformed_payload_is_discarded() {
        let (task, _rx) = task_with_chain(MiddlewareChain::new());
        let work = UnitOfWork {
            queue: "default".to_string(),
            payload: "not json".to_string(),
        };

        assert!(task.process_one(work).await.is_ok());
        assert_eq!(task.stats.snapshot().processed, 0);
    }

    #[tokio::test]
    async fn test_handled_failure_does_not_kill_processor() {
        // No retry policy on the job, so the retry entry discards without
        // touching Redis and the failure stays absorbed.
        let registry = Arc::new(HandlerRegistry::new());
        registry.register("Boom", Arc::new(FailingHandler));

        let pool = Arc::new(RedisPool::new("redis://127.0.0.1:1"));
        let mut chain = MiddlewareChain::new();
        chain.add(Arc::new(RetryMiddleware::new(Arc::clone(&pool))));
        chain.add(Arc::new(HandlerDispatch::new(registry)));

        let (task, _rx) = task_with_chain(chain);
        let work = UnitOfWork {
            queue: "default".to_string(),
            payload: r#"{"jid":"f1","class":"Boom","args":[]}"#.to_string(),
        };

        assert!(task.process_one(work).await.is_ok());
        let stats = task.stats.snapshot();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.processed, 0);
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_death_cause() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register("Panicky", Arc::new(PanickyHandler));

        let mut chain = MiddlewareChain::new();
        chain.add(Arc::new(HandlerDispatch::new(registry)));

        let (task, _rx) = task_with_chain(chain);
        let work = UnitOfWork {
            queue: "default".to_string(),
            payload: r#"{"jid":"p1","class":"Panicky","args":[]}"#.to_string(),
        };

        let cause = task.process_one(work).await.expect_err("should die");
        assert!(cause.contains("handler bug"));
    }
}
