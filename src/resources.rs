//! Pooled async handles over shared resources.
//!
//! One generic [`Pool`] serves all four resource kinds (relational store,
//! vector index, LLM client, blob storage). Admission is a semaphore, so
//! access is exclusive per acquired handle and serialized by the pool;
//! waiting suspends and is cancel-safe. Guards return their resource on
//! every exit path.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::config::ResourceConfig;
use crate::error::{Error, Result};

/// The kinds of pooled resources the engine manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    RelationalStore,
    VectorIndex,
    Llm,
    BlobStorage,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RelationalStore => write!(f, "relational_store"),
            Self::VectorIndex => write!(f, "vector_index"),
            Self::Llm => write!(f, "llm"),
            Self::BlobStorage => write!(f, "blob_storage"),
        }
    }
}

/// Point-in-time health of one pool.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub capacity: usize,
    pub in_use: usize,
    pub shutting_down: bool,
}

struct IdleEntry<T> {
    resource: T,
    parked_at: Instant,
}

struct PoolInner<T> {
    kind: ResourceKind,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleEntry<T>>>,
    factory: Box<dyn Fn() -> Result<T> + Send + Sync>,
    acquire_timeout: Duration,
    idle_ttl: Duration,
    shutdown: AtomicBool,
}

/// A bounded pool of lazily-created resources.
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Pool<T> {
    /// Create a pool that builds resources on demand via `factory`, up to
    /// `config.pool_size` live at once.
    pub fn new(
        kind: ResourceKind,
        config: &ResourceConfig,
        factory: impl Fn() -> Result<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                kind,
                capacity: config.pool_size,
                semaphore: Arc::new(Semaphore::new(config.pool_size)),
                idle: Mutex::new(Vec::new()),
                factory: Box::new(factory),
                acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
                idle_ttl: Duration::from_millis(config.idle_ttl_ms),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Acquire a handle, waiting up to the configured timeout.
    ///
    /// Fails with [`Error::ResourceShutdown`] during drain and
    /// [`Error::ResourceExhausted`] when the timeout elapses first.
    pub async fn acquire(&self) -> Result<PoolGuard<T>> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(Error::ResourceShutdown);
        }

        let permit = tokio::time::timeout(
            self.inner.acquire_timeout,
            Arc::clone(&self.inner.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| Error::ResourceExhausted {
            kind: self.inner.kind.to_string(),
        })?
        .map_err(|_| Error::ResourceShutdown)?;

        // Re-check after the wait: shutdown may have begun while queued.
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(Error::ResourceShutdown);
        }

        let resource = match self.checkout_idle() {
            Some(resource) => resource,
            None => (self.inner.factory)()?,
        };

        Ok(PoolGuard {
            resource: Some(resource),
            inner: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    fn checkout_idle(&self) -> Option<T> {
        let mut idle = self.inner.idle.lock().ok()?;
        // Expired entries are dropped, not handed out.
        idle.retain(|entry| entry.parked_at.elapsed() < self.inner.idle_ttl);
        idle.pop().map(|entry| entry.resource)
    }

    /// Current health snapshot.
    pub fn health(&self) -> HealthStatus {
        let available = self.inner.semaphore.available_permits();
        let shutting_down = self.inner.shutdown.load(Ordering::Acquire);
        HealthStatus {
            healthy: !shutting_down,
            capacity: self.inner.capacity,
            in_use: self.inner.capacity.saturating_sub(available),
            shutting_down,
        }
    }

    /// Drain the pool: fail new acquisitions immediately and wait for
    /// in-flight handles to come back, up to `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.inner.shutdown.store(true, Ordering::Release);
        info!(kind = %self.inner.kind, "draining resource pool");

        let drained = tokio::time::timeout(deadline, async {
            // Claiming every permit proves no handle is outstanding.
            let mut held = Vec::with_capacity(self.inner.capacity);
            for _ in 0..self.inner.capacity {
                match Arc::clone(&self.inner.semaphore).acquire_owned().await {
                    Ok(permit) => held.push(permit),
                    Err(_) => break,
                }
            }
        })
        .await;

        if let Ok(mut idle) = self.inner.idle.lock() {
            idle.clear();
        }

        drained.map_err(|_| Error::timeout(deadline.as_millis() as u64))
    }
}

/// RAII handle to a pooled resource. Returns the resource to the pool on
/// drop unless the pool is shutting down.
pub struct PoolGuard<T> {
    resource: Option<T>,
    inner: Arc<PoolInner<T>>,
    _permit: OwnedSemaphorePermit,
}

impl<T> std::fmt::Debug for PoolGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard").finish()
    }
}

impl<T> Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.resource.as_ref().expect("resource present until drop")
    }
}

impl<T> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource.as_mut().expect("resource present until drop")
    }
}

impl<T> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            if self.inner.shutdown.load(Ordering::Acquire) {
                debug!(kind = %self.inner.kind, "pool draining, dropping handle");
                return;
            }
            if let Ok(mut idle) = self.inner.idle.lock() {
                idle.push(IdleEntry {
                    resource,
                    parked_at: Instant::now(),
                });
            }
        }
    }
}

/// The engine's pools, one per resource kind.
pub struct ResourceManager {
    store: Pool<rusqlite::Connection>,
    vector: Pool<rusqlite::Connection>,
    llm: Pool<()>,
    blobs: Pool<()>,
}

impl ResourceManager {
    /// Build pools from connection factories. The LLM and blob pools are
    /// admission gates bounding concurrent calls.
    pub fn new(
        config: &ResourceConfig,
        store_factory: impl Fn() -> Result<rusqlite::Connection> + Send + Sync + 'static,
        vector_factory: impl Fn() -> Result<rusqlite::Connection> + Send + Sync + 'static,
    ) -> Self {
        Self {
            store: Pool::new(ResourceKind::RelationalStore, config, store_factory),
            vector: Pool::new(ResourceKind::VectorIndex, config, vector_factory),
            llm: Pool::new(ResourceKind::Llm, config, || Ok(())),
            blobs: Pool::new(ResourceKind::BlobStorage, config, || Ok(())),
        }
    }

    pub fn store_pool(&self) -> &Pool<rusqlite::Connection> {
        &self.store
    }

    pub fn vector_pool(&self) -> &Pool<rusqlite::Connection> {
        &self.vector
    }

    pub fn llm_gate(&self) -> &Pool<()> {
        &self.llm
    }

    pub fn blob_gate(&self) -> &Pool<()> {
        &self.blobs
    }

    /// Health of every pool.
    pub fn health(&self) -> HashMap<ResourceKind, HealthStatus> {
        HashMap::from([
            (ResourceKind::RelationalStore, self.store.health()),
            (ResourceKind::VectorIndex, self.vector.health()),
            (ResourceKind::Llm, self.llm.health()),
            (ResourceKind::BlobStorage, self.blobs.health()),
        ])
    }

    /// Drain all pools within one shared deadline.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        let started = Instant::now();
        let remaining = |started: Instant| deadline.saturating_sub(started.elapsed());

        self.store.shutdown(remaining(started)).await?;
        self.vector.shutdown(remaining(started)).await?;
        self.llm.shutdown(remaining(started)).await?;
        self.blobs.shutdown(remaining(started)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn small_config() -> ResourceConfig {
        ResourceConfig {
            pool_size: 2,
            acquire_timeout_ms: 50,
            idle_ttl_ms: 60_000,
        }
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let pool = Pool::new(ResourceKind::Llm, &small_config(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(42u32)
        });

        {
            let guard = pool.acquire().await.unwrap();
            assert_eq!(*guard, 42);
        }
        // Released handle is reused, not rebuilt.
        let _guard = pool.acquire().await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_times_out() {
        let pool = Pool::new(ResourceKind::RelationalStore, &small_config(), || Ok(()));
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_acquisitions() {
        let pool = Pool::new(ResourceKind::VectorIndex, &small_config(), || Ok(()));
        pool.shutdown(Duration::from_millis(100)).await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::ResourceShutdown));
        assert!(pool.health().shutting_down);
    }

    #[tokio::test]
    async fn test_shutdown_times_out_with_handle_outstanding() {
        let pool = Pool::new(ResourceKind::BlobStorage, &small_config(), || Ok(()));
        let _held = pool.acquire().await.unwrap();

        let err = pool.shutdown(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_health_reports_in_use() {
        let pool = Pool::new(ResourceKind::Llm, &small_config(), || Ok(()));
        assert_eq!(pool.health().in_use, 0);
        let _guard = pool.acquire().await.unwrap();
        assert_eq!(pool.health().in_use, 1);
        assert_eq!(pool.health().capacity, 2);
    }
}
