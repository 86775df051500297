//! jobforge server entry point.
//!
//! Initializes logging, loads configuration from the environment, and runs
//! the server until an interrupt requests a graceful stop. Handlers are
//! registered by embedders linking the library; this binary runs a bare
//! server, useful for draining queues of jobs it knows how to dispatch.

use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = jobforge::ServerConfig::from_env()?;
    let server = Arc::new(jobforge::Server::new(config));

    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.request_stop();
        }
    });

    server.run().await?;
    Ok(())
}
