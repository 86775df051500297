//! Shared Redis connection handle.
//!
//! Wraps a [`ConnectionManager`] behind a lazy initializer so server
//! construction stays I/O-free; the first Redis call made by a fetcher or
//! the retry middleware establishes the connection. The manager reconnects
//! on its own and is cheap to clone, so every call site checks out its own
//! clone for the duration of the operation.

use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;

/// Lazily connected, cloneable Redis access shared by all components.
pub struct RedisPool {
    url: String,
    manager: OnceCell<ConnectionManager>,
}

impl RedisPool {
    /// Creates a handle for `url` without connecting.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            manager: OnceCell::new(),
        }
    }

    /// The configured connection URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Checks out a connection, establishing the underlying manager on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`redis::RedisError`] when the URL is invalid
    /// or the initial connection fails.
    pub async fn get(&self) -> Result<ConnectionManager, redis::RedisError> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                let client = redis::Client::open(self.url.as_str())?;
                ConnectionManager::new(client).await
            })
            .await?;
        Ok(manager.clone())
    }
}

impl std::fmt::Debug for RedisPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPool")
            .field("url", &self.url)
            .field("connected", &self.manager.initialized())
            .finish()
    }
}
