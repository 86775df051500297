//! Lifecycle tests for the server controller.
//!
//! These exercise the public supervision surface: middleware defaults,
//! the shutdown flag, and processor replacement. No Redis server is
//! required; processors stay inert until `run` is called.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jobforge::{
    HandlerError, Job, JobArgs, JobContext, JobHandler, MiddlewareChain, Next, ProcessError,
    Server, ServerConfig, ServerMiddleware,
};

struct NoopMiddleware;

#[async_trait]
impl ServerMiddleware for NoopMiddleware {
    fn name(&self) -> &str {
        "Noop"
    }

    async fn call(
        &self,
        job: &mut Job,
        ctx: &JobContext,
        next: Next<'_>,
    ) -> Result<(), ProcessError> {
        next.run(job, ctx).await
    }
}

#[test]
fn test_new_server_has_three_middleware_entries() {
    let mut server = Server::new(ServerConfig::default());
    assert_eq!(server.middleware().entries().len(), 3);

    server.middleware_mut().add(Arc::new(NoopMiddleware));
    assert_eq!(server.middleware().entries().len(), 4);

    let removed = server.middleware_mut().remove(|entry| entry.name() == "Noop");
    assert_eq!(removed, 1);
    assert_eq!(server.middleware().entries().len(), 3);
}

struct RecordingMiddleware {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ServerMiddleware for RecordingMiddleware {
    fn name(&self) -> &str {
        "Recording"
    }

    async fn call(
        &self,
        job: &mut Job,
        ctx: &JobContext,
        next: Next<'_>,
    ) -> Result<(), ProcessError> {
        self.log
            .lock()
            .expect("lock not poisoned")
            .push("middleware:before".to_string());
        let result = next.run(job, ctx).await;
        self.log
            .lock()
            .expect("lock not poisoned")
            .push("middleware:after".to_string());
        result
    }
}

struct RecordingHandler {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn perform(&self, _args: JobArgs<'_>, _ctx: &JobContext) -> Result<(), HandlerError> {
        self.log
            .lock()
            .expect("lock not poisoned")
            .push("handler".to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_added_middleware_wraps_handler_dispatch() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut server = Server::new(ServerConfig::default());
    server.register(
        "Recorded",
        Arc::new(RecordingHandler {
            log: Arc::clone(&log),
        }),
    );
    server.middleware_mut().add(Arc::new(RecordingMiddleware {
        log: Arc::clone(&log),
    }));
    assert_eq!(server.middleware().entries().len(), 4);

    let mut job =
        Job::decode(r#"{"jid":"m1","class":"Recorded","args":[]}"#).expect("decode");
    let ctx = JobContext::new("default");
    server.middleware().invoke(&mut job, &ctx).await.expect("invoke");

    let entries = log.lock().expect("lock not poisoned").clone();
    assert_eq!(
        entries,
        vec!["middleware:before", "handler", "middleware:after"]
    );
}

#[test]
fn test_user_chain_keeps_defaults_plus_additions() {
    let mut chain = MiddlewareChain::new();
    chain.add(Arc::new(NoopMiddleware));
    assert_eq!(chain.entries().len(), 1);

    chain.prepend(Arc::new(NoopMiddleware));
    assert_eq!(chain.entries().len(), 2);
    assert_eq!(chain.remove(|entry| entry.name() == "Noop"), 2);
    assert!(chain.entries().is_empty());
}

#[test]
fn test_stop_request_is_idempotent() {
    let server = Server::new(ServerConfig::default());
    assert!(!server.is_stopping());

    server.request_stop();
    assert!(server.is_stopping());

    server.request_stop();
    assert!(server.is_stopping());
}

#[test]
fn test_processor_supervision_sequence() {
    let server = Server::new(ServerConfig::default());
    assert_eq!(server.processors().len(), 0);

    // Initial spawn: a death with no source seeds the set.
    let first = server.processor_died(None, None).expect("initial processor");
    assert_eq!(server.processors().len(), 1);

    // A stop report for a handle that is no longer a member is ignored.
    let second = server
        .processor_died(Some(&first), None)
        .expect("replacement");
    server.processor_stopped(&first);
    assert_eq!(server.processors().len(), 1);
    assert!(server.processors().contains(&second));

    // After a stop request, deaths shrink the set instead of replacing.
    server.request_stop();
    assert!(server.processor_died(Some(&second), None).is_none());
    assert_eq!(server.processors().len(), 0);
}

#[test]
fn test_voluntary_stop_removes_member() {
    let server = Server::new(ServerConfig::default());
    let first = server.processor_died(None, None).expect("initial processor");

    server.processor_stopped(&first);
    assert_eq!(server.processors().len(), 0);
}

#[tokio::test]
async fn test_run_quiesces_when_stopped_before_start() {
    // With a stop already requested, no processors are spawned and the
    // run loop returns as soon as it observes the empty set.
    let server = Server::new(
        ServerConfig::default().with_concurrency(2),
    );
    server.request_stop();

    server.run().await.expect("run should quiesce immediately");
    assert_eq!(server.processors().len(), 0);
}
