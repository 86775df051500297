//! jobforge: Redis-backed background job server.
//!
//! Producers enqueue JSON job payloads onto Redis lists; this crate is the
//! consuming side. A [`Server`] supervises a pool of processors, each of
//! which fetches payloads, runs them through a middleware chain around the
//! registered handler, and records failures back into Redis as scheduled
//! retries or dead jobs.
//!
//! # Architecture
//!
//! ```text
//!                   ┌──────────────┐
//!                   │   Producer   │
//!                   └──────┬───────┘
//!                          │ LPUSH queue:<name>
//!                   ┌──────▼───────┐
//!                   │    Redis     │◀── ZADD retry / dead
//!                   └──────┬───────┘
//!                          │ BRPOP
//!        ┌─────────────────┼─────────────────┐
//!        ▼                 ▼                 ▼
//!   ┌──────────┐     ┌──────────┐     ┌──────────┐
//!   │Processor1│     │Processor2│     │ProcessorN│
//!   └────┬─────┘     └────┬─────┘     └────┬─────┘
//!        └───── stopped / died events ─────┘
//!                          │
//!                   ┌──────▼───────┐
//!                   │    Server    │
//!                   └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use jobforge::{Server, ServerConfig, JobHandler, JobArgs, JobContext, HandlerError};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct EmailWorker;
//!
//! #[async_trait]
//! impl JobHandler for EmailWorker {
//!     async fn perform(&self, args: JobArgs<'_>, _ctx: &JobContext) -> Result<(), HandlerError> {
//!         let (user_id,): (u64,) = args.decode()?;
//!         send_welcome_email(user_id).await;
//!         Ok(())
//!     }
//! }
//!
//! let config = ServerConfig::from_env()?;
//! let server = Server::new(config);
//! server.register("EmailWorker", Arc::new(EmailWorker));
//! server.run().await?;
//! ```
//!
//! # Failure handling
//!
//! Handler failures are recorded onto the job (`retry_count`, `failed_at`,
//! error summary) and the job is scheduled into the `retry` sorted set
//! with exponential backoff, or moved to the capped `dead` set once its
//! attempts are exhausted. Infrastructure failures kill the processor; the
//! server replaces it unless shutdown is in progress.

// Core modules
pub mod config;
pub mod fetch;
pub mod handler;
pub mod job;
pub mod middleware;
pub mod pool;
pub mod processor;
pub mod retry;
pub mod server;

// Re-export the types most embedders need
pub use config::{ConfigError, ServerConfig};
pub use fetch::{FetchError, Fetcher, UnitOfWork};
pub use handler::{HandlerDispatch, HandlerError, HandlerRegistry, JobArgs, JobHandler};
pub use job::{BacktracePolicy, DecodeError, Job, RetryPolicy};
pub use middleware::{
    JobContext, JobLogger, MiddlewareChain, Next, ProcessError, ServerMiddleware,
};
pub use pool::RedisPool;
pub use processor::Processor;
pub use retry::{Jitter, RetryMiddleware};
pub use server::{Server, ServerError, ServerStats};
