//! Keyed reuse of physical connections.
//!
//! Idle connections live in one FIFO bucket per [`PoolKey`]. A connection is
//! either in exactly one bucket or owned by exactly one caller; moving it in
//! and out only happens under the bucket lock, and every network round trip
//! (validation, reset, close) happens with no lock held.

mod connection;
mod health;
mod registry;
mod sweeper;

use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

pub use connection::PooledConnection;

use crate::config::{PoolKey, PoolSettings};
use crate::error::PqMiddlewareError;
use crate::native::{NativeConnection, NativeDriver};
use registry::PoolRegistry;

pub(crate) struct PoolInner<D: NativeDriver> {
    driver: D,
    settings: PoolSettings,
    registry: PoolRegistry<D::Conn>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<D: NativeDriver> Drop for PoolInner<D> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Connection pool keyed by connection descriptor.
///
/// Cloning is cheap and every clone shares the same buckets.
///
/// ```rust,no_run
/// use pq_middleware::prelude::*;
///
/// # async fn demo() -> Result<(), PqMiddlewareError> {
/// let pool = ConnectionPool::start(PgDriver, PoolSettings::default())?;
/// let key = PoolKey::from_pairs([("host", "localhost"), ("user", "app"), ("dbname", "app")])?;
/// let mut conn = pool.get_connection(&key).await?;
/// let mut cmd = Command::new("select :n + 1");
/// cmd.parameters_mut().add("n", 41)?;
/// let answer = conn.execute_scalar(&mut cmd).await?;
/// conn.close().await;
/// # let _ = answer;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<D: NativeDriver> {
    inner: Arc<PoolInner<D>>,
}

impl<D: NativeDriver> Clone for ConnectionPool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: NativeDriver> std::fmt::Debug for ConnectionPool<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("settings", &self.inner.settings)
            .field("idle", &self.total_idle())
            .finish_non_exhaustive()
    }
}

impl<D: NativeDriver> ConnectionPool<D> {
    /// Build a pool without a background sweeper; call [`ConnectionPool::sweep`]
    /// yourself or use [`ConnectionPool::start`].
    #[must_use]
    pub fn new(driver: D, settings: PoolSettings) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                driver,
                settings,
                registry: PoolRegistry::default(),
                shutdown: CancellationToken::new(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Build a pool and spawn its sweeper on the current tokio runtime.
    ///
    /// # Errors
    /// Returns `PqMiddlewareError::ConfigError` for invalid settings or when
    /// called outside a tokio runtime.
    pub fn start(driver: D, settings: PoolSettings) -> Result<Self, PqMiddlewareError> {
        settings.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(PqMiddlewareError::ConfigError(
                "the pool sweeper needs a running tokio runtime".into(),
            ));
        }
        let pool = Self::new(driver, settings);
        let handle = sweeper::spawn(
            Arc::downgrade(&pool.inner),
            pool.inner.settings.sweep_interval,
            pool.inner.shutdown.clone(),
        );
        *pool
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(pool)
    }

    #[must_use]
    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    #[must_use]
    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    /// Get a validated connection for `key`, opening a new one when no idle
    /// connection passes validation.
    ///
    /// # Errors
    /// Returns the driver's error (typically `PqMiddlewareError::ConnectionError`)
    /// when a new connection cannot be opened.
    pub async fn acquire(&self, key: &PoolKey) -> Result<D::Conn, PqMiddlewareError> {
        self.inner.acquire(key).await
    }

    /// Return a connection. It is cleaned and queued for reuse, or closed if it
    /// cannot be cleaned or its bucket is full. Never fails.
    pub async fn release(&self, key: &PoolKey, conn: D::Conn) {
        self.inner.release(key, conn).await;
    }

    /// Thin out buckets whose head has sat idle for too many sweeps.
    pub async fn sweep(&self) {
        self.inner.sweep().await;
    }

    /// Close every idle connection.
    pub async fn clear(&self) {
        self.inner.clear().await;
    }

    /// Stop the background sweeper and close every idle connection.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.clear().await;
    }

    /// Acquire wrapped in a [`PooledConnection`] that goes back to this pool
    /// on close.
    ///
    /// # Errors
    /// Same as [`ConnectionPool::acquire`].
    pub async fn get_connection(
        &self,
        key: &PoolKey,
    ) -> Result<PooledConnection<D>, PqMiddlewareError> {
        let conn = self.acquire(key).await?;
        Ok(PooledConnection::new(self.clone(), key.clone(), conn))
    }

    /// Idle connections queued for `key`.
    #[must_use]
    pub fn idle_count(&self, key: &PoolKey) -> usize {
        self.inner
            .registry
            .bucket(key)
            .map_or(0, |bucket| bucket.len())
    }

    #[must_use]
    pub fn total_idle(&self) -> usize {
        self.inner
            .registry
            .snapshot()
            .iter()
            .map(|(_, bucket)| bucket.len())
            .sum()
    }
}

impl<D: NativeDriver> PoolInner<D> {
    async fn acquire(&self, key: &PoolKey) -> Result<D::Conn, PqMiddlewareError> {
        let bucket = self.registry.bucket_or_insert(key);

        if let Some(mut conn) = bucket.take_head() {
            if health::check_or_reset(&mut conn, &self.settings).await {
                tracing::debug!(key = %key, "reusing pooled connection");
                return Ok(conn);
            }
            tracing::warn!(key = %key, "discarding pooled connection that failed validation");
            conn.finish().await;
        }

        tracing::debug!(key = %key, "opening new connection");
        self.driver.connect(key).await.map_err(|err| match err {
            PqMiddlewareError::ConnectionError(_) => err,
            other => PqMiddlewareError::ConnectionError(format!("{key}: {other}")),
        })
    }

    async fn release(&self, key: &PoolKey, mut conn: D::Conn) {
        let Some(bucket) = self.registry.bucket(key) else {
            tracing::debug!(key = %key, "no bucket for released connection; closing");
            conn.finish().await;
            return;
        };

        if !health::discard(&mut conn).await {
            tracing::warn!(
                key = %key,
                error = %conn.error_message(),
                "released connection could not be reset; closing"
            );
            conn.finish().await;
            return;
        }

        if let Err(conn) = bucket.offer(conn, self.settings.max_idle_per_key) {
            tracing::debug!(
                key = %key,
                max_idle = self.settings.max_idle_per_key,
                "bucket full; closing released connection"
            );
            conn.finish().await;
        }
    }

    async fn sweep(&self) {
        let mut evicted = Vec::new();
        for (key, bucket) in self.registry.snapshot() {
            let closing = bucket.sweep(self.settings.visit_threshold);
            if !closing.is_empty() {
                tracing::debug!(
                    key = %key,
                    evicted = closing.len(),
                    remaining = bucket.len(),
                    "sweeping idle connections"
                );
                evicted.extend(closing);
            }
        }
        for conn in evicted {
            conn.finish().await;
        }
    }

    async fn clear(&self) {
        let mut closing = Vec::new();
        for (_, bucket) in self.registry.snapshot() {
            closing.extend(bucket.drain());
        }
        if !closing.is_empty() {
            tracing::debug!(closed = closing.len(), "clearing pool");
        }
        for conn in closing {
            conn.finish().await;
        }
    }
}
