//! Handler resolution and dispatch.
//!
//! The mapping from a payload's `class` name to executable code lives in a
//! [`HandlerRegistry`]; the [`HandlerDispatch`] entry sits innermost in the
//! server middleware chain and performs the actual call. Handlers receive
//! the job's argument array through [`JobArgs`], which can deserialize it
//! into typed values instead of exposing raw JSON throughout.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::job::Job;
use crate::middleware::{JobContext, Next, ProcessError, ServerMiddleware};

/// A failure raised by handler code (or by dispatch itself).
///
/// Carries the pieces the retry bookkeeping needs: a class name, a message,
/// and optional backtrace frames.
#[derive(Debug, Clone, Error)]
#[error("{class}: {message}")]
pub struct HandlerError {
    class: String,
    message: String,
    backtrace: Vec<String>,
}

impl HandlerError {
    /// Creates a failure with a class name and message.
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            backtrace: Vec::new(),
        }
    }

    /// Attaches backtrace frames, outermost first.
    pub fn with_backtrace(mut self, frames: Vec<String>) -> Self {
        self.backtrace = frames;
        self
    }

    /// Class name recorded as `error_class` on failure.
    pub fn class_name(&self) -> &str {
        &self.class
    }

    /// Message recorded as `error_message` on failure.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Captured frames, possibly empty.
    pub fn backtrace(&self) -> &[String] {
        &self.backtrace
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::new("ArgumentError", e.to_string())
    }
}

/// Borrowed view over a job's argument array.
#[derive(Debug, Clone, Copy)]
pub struct JobArgs<'a> {
    values: &'a [Value],
}

impl<'a> JobArgs<'a> {
    /// Wraps the raw argument values.
    pub fn new(values: &'a [Value]) -> Self {
        Self { values }
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the job carries no arguments.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Positional access to a raw value.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Deserializes the whole argument array into a typed value, usually a
    /// tuple matching the handler's expected signature.
    ///
    /// # Errors
    ///
    /// Returns an `ArgumentError` handler failure when the array does not
    /// match `T`; the failure flows through the normal retry path.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_value(Value::Array(self.values.to_vec()))?)
    }

    /// The raw values, for handlers that want them untyped.
    pub fn raw(&self) -> &[Value] {
        self.values
    }
}

/// Executable side of a job class.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Performs one unit of work.
    ///
    /// # Errors
    ///
    /// Any returned [`HandlerError`] is recorded by the retry middleware
    /// and re-raised; it never kills the processor.
    async fn perform(&self, args: JobArgs<'_>, ctx: &JobContext) -> Result<(), HandlerError>;
}

/// Maps payload `class` names to handlers.
///
/// Registration happens before the server starts; resolution is shared
/// read-mostly across processors.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous entry.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers
            .write()
            .expect("lock not poisoned")
            .insert(name.into(), handler);
    }

    /// Looks up the handler for a payload class name.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .expect("lock not poisoned")
            .get(name)
            .cloned()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.read().expect("lock not poisoned").len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Innermost chain entry: resolves the job's class and runs its handler.
///
/// An unresolved class name is reported as a `HandlerNotFound` failure and
/// takes the same retry path as any handler exception.
pub struct HandlerDispatch {
    registry: Arc<HandlerRegistry>,
}

impl HandlerDispatch {
    /// Creates the dispatch entry over a shared registry.
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ServerMiddleware for HandlerDispatch {
    fn name(&self) -> &str {
        "HandlerDispatch"
    }

    fn terminal(&self) -> bool {
        true
    }

    async fn call(
        &self,
        job: &mut Job,
        ctx: &JobContext,
        _next: Next<'_>,
    ) -> Result<(), ProcessError> {
        let handler = self.registry.resolve(&job.klass).ok_or_else(|| {
            HandlerError::new(
                "HandlerNotFound",
                format!("no handler registered for class '{}'", job.klass),
            )
        })?;

        handler
            .perform(JobArgs::new(&job.args), ctx)
            .await
            .map_err(ProcessError::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::MiddlewareChain;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn perform(&self, args: JobArgs<'_>, _ctx: &JobContext) -> Result<(), HandlerError> {
            let (user_id, reason): (u64, String) = args.decode()?;
            assert_eq!(user_id, 42);
            assert_eq!(reason, "welcome");
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_registry_register_and_resolve() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.resolve("EmailWorker").is_none());

        registry.register(
            "EmailWorker",
            Arc::new(CountingHandler {
                calls: AtomicUsize::new(0),
            }),
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.resolve("EmailWorker").is_some());
    }

    #[test]
    fn test_args_typed_decode() {
        let values = vec![json!(1), json!("two")];
        let args = JobArgs::new(&values);

        let (a, b): (u64, String) = args.decode().expect("decode");
        assert_eq!(a, 1);
        assert_eq!(b, "two");
        assert_eq!(args.len(), 2);
        assert_eq!(args.get(0), Some(&json!(1)));
    }

    #[test]
    fn test_args_decode_mismatch_is_argument_error() {
        let values = vec![json!("not a number")];
        let args = JobArgs::new(&values);

        let err = args.decode::<(u64,)>().expect_err("should not decode");
        assert_eq!(err.class_name(), "ArgumentError");
    }

    #[tokio::test]
    async fn test_dispatch_runs_registered_handler() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(
            "EmailWorker",
            Arc::new(CountingHandler {
                calls: AtomicUsize::new(0),
            }),
        );

        let mut chain = MiddlewareChain::new();
        chain.add(Arc::new(HandlerDispatch::new(Arc::clone(&registry))));

        let mut job =
            Job::decode(r#"{"jid":"j1","class":"EmailWorker","args":[42,"welcome"]}"#)
                .expect("decode");
        let ctx = JobContext::new("default");

        chain.invoke(&mut job, &ctx).await.expect("invoke");
    }

    #[tokio::test]
    async fn test_dispatch_unknown_class_is_retryable_failure() {
        let registry = Arc::new(HandlerRegistry::new());
        let mut chain = MiddlewareChain::new();
        chain.add(Arc::new(HandlerDispatch::new(registry)));

        let mut job =
            Job::decode(r#"{"jid":"j2","class":"Missing","args":[]}"#).expect("decode");
        let ctx = JobContext::new("default");

        match chain.invoke(&mut job, &ctx).await {
            Err(ProcessError::Failed(e)) => {
                assert_eq!(e.class_name(), "HandlerNotFound");
                assert!(e.message().contains("Missing"));
            }
            other => panic!("expected HandlerNotFound failure, got {other:?}"),
        }
    }
}
