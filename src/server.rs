//! Server controller: configuration, middleware, and processor
//! supervision.
//!
//! The controller owns the middleware chain and the set of processor
//! handles. Processor tasks never touch the set themselves; they send
//! [`ProcessorEvent`]s which the supervisory loop in [`Server::run`] turns
//! into `processor_stopped` / `processor_died` calls. Those calls, plus
//! `request_stop`, are the only mutations of supervision state and are
//! serialized behind one mutex.
//!
//! Shutdown is cooperative: `request_stop` flips a single atomic flag,
//! fetchers observe it at their next blocking boundary, and the run loop
//! returns once every processor has reported in or the shutdown deadline
//! passes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::fetch::Fetcher;
use crate::handler::{HandlerDispatch, HandlerRegistry, JobHandler};
use crate::middleware::{JobLogger, MiddlewareChain};
use crate::pool::RedisPool;
use crate::processor::{Processor, ProcessorEvent, ProcessorTask};
use crate::retry::RetryMiddleware;

/// Errors that can occur while running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// `run` was called while the server was already running.
    #[error("Server is already running")]
    AlreadyRunning,

    /// Processors did not quiesce within the shutdown deadline.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// The configuration failed validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Snapshot of job counters since the server was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Jobs that completed without a failure.
    pub processed: u64,
    /// Jobs whose execution failed, whether retried or not.
    pub failed: u64,
}

/// Shared atomic counters updated by processor tasks.
pub(crate) struct SharedStats {
    processed: AtomicU64,
    failed: AtomicU64,
}

impl SharedStats {
    pub(crate) fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_success(&self) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn snapshot(&self) -> ServerStats {
        ServerStats {
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// The job server: supervises processors and coordinates shutdown.
pub struct Server {
    config: ServerConfig,
    chain: MiddlewareChain,
    registry: Arc<HandlerRegistry>,
    pool: Arc<RedisPool>,
    stopping: Arc<AtomicBool>,
    running: AtomicBool,
    runtime_chain: OnceLock<Arc<MiddlewareChain>>,
    processors: Mutex<Vec<Processor>>,
    events_tx: mpsc::UnboundedSender<ProcessorEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ProcessorEvent>>>,
    stats: Arc<SharedStats>,
}

impl Server {
    /// Creates a server over `config` with the default middleware chain:
    /// job logger, retry, handler dispatch.
    ///
    /// No connection is made until [`Server::run`].
    pub fn new(config: ServerConfig) -> Self {
        let pool = Arc::new(RedisPool::new(config.redis_url.clone()));
        let registry = Arc::new(HandlerRegistry::new());

        let mut chain = MiddlewareChain::new();
        chain.add(Arc::new(JobLogger::new()));
        chain.add(Arc::new(RetryMiddleware::new(Arc::clone(&pool))));
        chain.add(Arc::new(HandlerDispatch::new(Arc::clone(&registry))));

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            config,
            chain,
            registry,
            pool,
            stopping: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
            runtime_chain: OnceLock::new(),
            processors: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            stats: Arc::new(SharedStats::new()),
        }
    }

    /// The middleware chain.
    pub fn middleware(&self) -> &MiddlewareChain {
        &self.chain
    }

    /// Mutable access to the chain for adding user middleware.
    ///
    /// Changes made after [`Server::run`] has started are not observed by
    /// running processors; the chain is snapshotted at startup.
    pub fn middleware_mut(&mut self) -> &mut MiddlewareChain {
        &mut self.chain
    }

    /// The handler registry jobs are dispatched through.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Registers a handler under a payload class name.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.registry.register(name, handler);
    }

    /// Current set of live processors.
    pub fn processors(&self) -> Vec<Processor> {
        self.processors.lock().expect("lock not poisoned").clone()
    }

    /// Job counters since creation.
    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }

    /// Requests a cooperative stop. Idempotent.
    pub fn request_stop(&self) {
        if !self.stopping.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
        }
    }

    /// Whether a stop has been requested.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Records a voluntary processor exit; the processor is not replaced.
    ///
    /// Unknown handles are ignored, which covers a processor that managed
    /// to report both a death and a stop.
    pub fn processor_stopped(&self, processor: &Processor) {
        let mut set = self.processors.lock().expect("lock not poisoned");
        if let Some(position) = set.iter().position(|known| known == processor) {
            set.remove(position);
            debug!(processor_id = %processor.id(), remaining = set.len(), "Processor exited");
        }
    }

    /// Records an involuntary processor death and spawns a replacement
    /// unless the server is stopping.
    ///
    /// `None` marks an initial or unknown source: nothing is removed and a
    /// new processor is always added (again, unless stopping). Returns the
    /// replacement handle, or `None` when no processor was started.
    pub fn processor_died(
        &self,
        processor: Option<&Processor>,
        cause: Option<&str>,
    ) -> Option<Processor> {
        let mut set = self.processors.lock().expect("lock not poisoned");

        if let Some(processor) = processor {
            if let Some(position) = set.iter().position(|known| known == processor) {
                set.remove(position);
            }
            warn!(
                processor_id = %processor.id(),
                cause = cause.unwrap_or("unknown"),
                "Processor died"
            );
        }

        if self.is_stopping() {
            return None;
        }

        let replacement = Processor::new();
        set.push(replacement.clone());
        drop(set);

        self.spawn_processor(replacement.clone());
        Some(replacement)
    }

    /// Runs the server until it quiesces after a stop request.
    ///
    /// Spawns the configured number of processors, then consumes their
    /// notifications: deaths are replaced while the server is live, and
    /// once [`Server::request_stop`] has been called the loop drains
    /// remaining processors until the set is empty or the shutdown
    /// deadline passes.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AlreadyRunning`] on reentry,
    /// [`ServerError::Config`] for an invalid configuration, and
    /// [`ServerError::ShutdownTimeout`] when processors fail to quiesce in
    /// time.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.config.validate()?;

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let mut events = match self.events_rx.lock().expect("lock not poisoned").take() {
            Some(receiver) => receiver,
            None => {
                self.running.store(false, Ordering::SeqCst);
                return Err(ServerError::AlreadyRunning);
            }
        };

        self.runtime_chain
            .get_or_init(|| Arc::new(self.chain.clone()));

        info!(
            concurrency = self.config.concurrency,
            queues = ?self.config.queues,
            "Server starting"
        );

        for _ in 0..self.config.concurrency {
            self.processor_died(None, None);
        }

        let mut shutdown_deadline: Option<tokio::time::Instant> = None;

        loop {
            if self.is_stopping() {
                if self.processors.lock().expect("lock not poisoned").is_empty() {
                    break;
                }

                let deadline = *shutdown_deadline.get_or_insert_with(|| {
                    tokio::time::Instant::now() + self.config.shutdown_timeout
                });

                match tokio::time::timeout_at(deadline, events.recv()).await {
                    Ok(Some(event)) => self.handle_event(event),
                    Ok(None) => break,
                    Err(_) => {
                        self.running.store(false, Ordering::SeqCst);
                        warn!(
                            remaining = self.processors.lock().expect("lock not poisoned").len(),
                            "Abandoning processors at shutdown deadline"
                        );
                        return Err(ServerError::ShutdownTimeout(self.config.shutdown_timeout));
                    }
                }
            } else {
                match events.recv().await {
                    Some(event) => self.handle_event(event),
                    None => break,
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Server shutdown complete");
        Ok(())
    }

    fn handle_event(&self, event: ProcessorEvent) {
        match event {
            ProcessorEvent::Stopped(processor) => self.processor_stopped(&processor),
            ProcessorEvent::Died(processor, cause) => {
                self.processor_died(Some(&processor), Some(&cause));
            }
        }
    }

    /// Starts the task behind a processor handle. A no-op until the server
    /// is running; handles recorded earlier stay inert.
    fn spawn_processor(&self, handle: Processor) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let Some(chain) = self.runtime_chain.get() else {
            return;
        };

        let task = ProcessorTask {
            handle,
            fetcher: Fetcher::new(
                Arc::clone(&self.pool),
                &self.config.queues,
                self.config.fetch_timeout,
                Arc::clone(&self.stopping),
            ),
            chain: Arc::clone(chain),
            pool: Arc::clone(&self.pool),
            stopping: Arc::clone(&self.stopping),
            events: self.events_tx.clone(),
            stats: Arc::clone(&self.stats),
        };

        tokio::spawn(task.run());
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("middleware", &self.chain)
            .field("stopping", &self.is_stopping())
            .field(
                "processors",
                &self.processors.lock().expect("lock not poisoned").len(),
            )
            .finish()
    }
}
