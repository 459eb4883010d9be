//! Admission pools and the registry that owns them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::config::PoolsConfig;
use super::metrics::PoolMetrics;

/// Name of the catch-all pool used when a request names no model or an
/// unconfigured one.
pub const DEFAULT_POOL: &str = "default";

/// Capacity substituted for non-positive configured values.
const FALLBACK_CAPACITY: usize = 10;

/// Error types for admission.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AcquireError {
    /// No slot became free within the admission wait.
    #[error("admission wait of {wait:?} elapsed")]
    TimedOut { wait: Duration },

    /// The registry was shut down.
    #[error("admission pools are shut down")]
    Closed,
}

/// A bounded admission pool for one model.
#[derive(Debug)]
pub struct ModelPool {
    name: String,
    capacity: usize,
    slots: Arc<Semaphore>,
    metrics: Arc<PoolMetrics>,
}

impl ModelPool {
    fn new(name: impl Into<String>, capacity: usize) -> Self {
        let name = name.into();
        Self {
            metrics: Arc::new(PoolMetrics::new(name.clone())),
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            name,
        }
    }

    /// Pool name (the `model` field value, or `default`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum concurrent admissions.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Counters observed by the reporter.
    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    /// Number of currently free slots.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Wait up to `wait` for a free slot.
    ///
    /// Waiters on one pool are served in arrival order. Dropping the
    /// returned future leaves the wait queue without consuming a slot.
    pub async fn acquire(&self, wait: Duration) -> Result<AdmissionToken, AcquireError> {
        let queued = PoolMetrics::enter_queue(&self.metrics);
        match tokio::time::timeout(wait, Arc::clone(&self.slots).acquire_owned()).await {
            Ok(Ok(permit)) => {
                queued.admit();
                Ok(AdmissionToken { metrics: Arc::clone(&self.metrics), permit })
            }
            Ok(Err(_closed)) => Err(AcquireError::Closed),
            Err(_elapsed) => Err(AcquireError::TimedOut { wait }),
        }
    }
}

/// One-shot handle proving a pool slot is held.
///
/// Dropping the token (or calling [`release`](Self::release)) returns the
/// slot; holding it by value makes a second release unrepresentable. The
/// `processing` counter is decremented before the slot is handed to the
/// next waiter.
#[derive(Debug)]
pub struct AdmissionToken {
    metrics: Arc<PoolMetrics>,
    permit: OwnedSemaphorePermit,
}

impl AdmissionToken {
    /// Name of the pool this token belongs to.
    pub fn pool(&self) -> &str {
        self.metrics.model()
    }

    /// Release the slot explicitly.
    pub fn release(self) {}
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        // Runs before the permit field is dropped, so the counter update is
        // ordered before the next waiter's admission.
        self.metrics.finish_processing();
    }
}

/// Process-wide mapping from model name to admission pool.
///
/// Built once from configuration and read-only afterwards. Lookups for
/// unconfigured models fall back to the always-present `default` pool.
#[derive(Debug)]
pub struct PoolRegistry {
    pools: HashMap<String, Arc<ModelPool>>,
    admission_wait: Duration,
    shutdown: CancellationToken,
}

impl PoolRegistry {
    pub fn new(config: PoolsConfig) -> Self {
        let mut pools = HashMap::new();
        for entry in &config.models {
            let capacity = if entry.capacity <= 0 {
                warn!(
                    model = %entry.name,
                    configured = entry.capacity,
                    fallback = FALLBACK_CAPACITY,
                    "invalid pool capacity, using fallback"
                );
                FALLBACK_CAPACITY
            } else {
                entry.capacity as usize
            };
            pools.insert(entry.name.clone(), Arc::new(ModelPool::new(&entry.name, capacity)));
        }

        // The catch-all pool always exists, shadowing a configured entry of
        // the same name.
        pools.insert(
            DEFAULT_POOL.to_string(),
            Arc::new(ModelPool::new(DEFAULT_POOL, config.default_capacity)),
        );

        Self {
            pools,
            admission_wait: config.admission_wait,
            shutdown: CancellationToken::new(),
        }
    }

    /// Resolve a model name to its pool, falling back to `default`.
    pub fn lookup(&self, model: &str) -> &Arc<ModelPool> {
        match self.pools.get(model) {
            Some(pool) => pool,
            None => &self.pools[DEFAULT_POOL],
        }
    }

    /// Admit a request for `model`, waiting up to the configured admission
    /// deadline for a free slot.
    pub async fn acquire(&self, model: &str) -> Result<AdmissionToken, AcquireError> {
        self.lookup(model).acquire(self.admission_wait).await
    }

    /// All pools, configured plus `default`.
    pub fn pools(&self) -> impl Iterator<Item = &Arc<ModelPool>> {
        self.pools.values()
    }

    /// Configured admission deadline.
    pub fn admission_wait(&self) -> Duration {
        self.admission_wait
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the reporters and reject further admissions. Outstanding tokens
    /// stay valid until dropped.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for pool in self.pools.values() {
            pool.slots.close();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::config::ModelCapacity;
    use std::sync::Mutex;

    fn registry_with(models: Vec<ModelCapacity>, default_capacity: usize) -> PoolRegistry {
        PoolRegistry::new(PoolsConfig {
            models,
            default_capacity,
            admission_wait: Duration::from_millis(50),
        })
    }

    #[test]
    fn unknown_model_falls_back_to_default() {
        let registry = registry_with(vec![ModelCapacity::new("llama3", 2)], 7);

        assert_eq!(registry.lookup("llama3").name(), "llama3");
        assert_eq!(registry.lookup("nope").name(), DEFAULT_POOL);
        assert_eq!(registry.lookup("").name(), DEFAULT_POOL);
        assert_eq!(registry.lookup(DEFAULT_POOL).capacity(), 7);
    }

    #[test]
    fn invalid_capacity_is_replaced() {
        let registry =
            registry_with(vec![ModelCapacity::new("zero", 0), ModelCapacity::new("neg", -3)], 1);

        assert_eq!(registry.lookup("zero").capacity(), FALLBACK_CAPACITY);
        assert_eq!(registry.lookup("neg").capacity(), FALLBACK_CAPACITY);
    }

    #[test]
    fn default_pool_shadows_configured_entry() {
        let registry = registry_with(vec![ModelCapacity::new(DEFAULT_POOL, 3)], 9);
        assert_eq!(registry.lookup(DEFAULT_POOL).capacity(), 9);
    }

    #[tokio::test]
    async fn acquire_and_release_update_counters() {
        let registry = registry_with(vec![ModelCapacity::new("m", 2)], 1);
        let pool = Arc::clone(registry.lookup("m"));

        let token = registry.acquire("m").await.unwrap();
        assert_eq!(token.pool(), "m");
        assert_eq!(pool.metrics().processing_count(), 1);
        assert_eq!(pool.metrics().queue_depth(), 0);
        assert_eq!(pool.available(), 1);

        token.release();
        assert_eq!(pool.metrics().processing_count(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn capacity_is_a_hard_ceiling() {
        let registry = registry_with(vec![ModelCapacity::new("m", 2)], 1);
        let pool = Arc::clone(registry.lookup("m"));

        let first = registry.acquire("m").await.unwrap();
        let second = registry.acquire("m").await.unwrap();
        assert_eq!(pool.metrics().processing_count(), 2);

        let err = registry.acquire("m").await.unwrap_err();
        assert!(matches!(err, AcquireError::TimedOut { .. }));
        // The failed wait left the queue.
        assert_eq!(pool.metrics().queue_depth(), 0);
        assert_eq!(pool.metrics().processing_count(), 2);

        drop(first);
        let third = registry.acquire("m").await.unwrap();
        assert_eq!(pool.metrics().processing_count(), 2);
        drop(second);
        drop(third);
        assert_eq!(pool.metrics().processing_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn admission_deadline_uses_configured_wait() {
        let registry = PoolRegistry::new(PoolsConfig {
            models: vec![ModelCapacity::new("m", 1)],
            ..PoolsConfig::default()
        });

        let _held = registry.acquire("m").await.unwrap();

        let start = tokio::time::Instant::now();
        let err = registry.acquire("m").await.unwrap_err();
        assert_eq!(err, AcquireError::TimedOut { wait: Duration::from_secs(75) });
        assert_eq!(start.elapsed(), Duration::from_secs(75));
    }

    #[tokio::test]
    async fn waiters_are_admitted_in_arrival_order() {
        let registry = Arc::new(registry_with(vec![ModelCapacity::new("m", 1)], 1));
        let held = registry
            .lookup("m")
            .acquire(Duration::from_secs(5))
            .await
            .unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let registry = Arc::clone(&registry);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let token = registry
                    .lookup("m")
                    .acquire(Duration::from_secs(5))
                    .await
                    .unwrap();
                order.lock().unwrap().push(i);
                token.release();
            }));
            // Let the waiter join the queue before spawning the next one.
            tokio::task::yield_now().await;
        }

        assert_eq!(registry.lookup("m").metrics().queue_depth(), 3);
        held.release();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn dropped_waiter_leaves_the_queue_without_a_slot() {
        let registry = Arc::new(registry_with(vec![ModelCapacity::new("m", 1)], 1));
        let pool = Arc::clone(registry.lookup("m"));
        let held = pool.acquire(Duration::from_secs(5)).await.unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let _ = registry.acquire("m").await;
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(pool.metrics().queue_depth(), 1);

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(pool.metrics().queue_depth(), 0);

        held.release();
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.metrics().processing_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_admissions() {
        let registry = registry_with(vec![ModelCapacity::new("m", 1)], 1);

        let held = registry.acquire("m").await.unwrap();
        registry.shutdown();
        assert!(registry.is_shut_down());

        let err = registry.acquire("m").await.unwrap_err();
        assert_eq!(err, AcquireError::Closed);
        let err = registry.acquire("other").await.unwrap_err();
        assert_eq!(err, AcquireError::Closed);

        // Outstanding tokens still release cleanly.
        held.release();
        assert_eq!(registry.lookup("m").metrics().processing_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_wakes_pending_waiters() {
        let registry = Arc::new(registry_with(vec![ModelCapacity::new("m", 1)], 1));
        let _held = registry.acquire("m").await.unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.acquire("m").await })
        };
        tokio::task::yield_now().await;

        registry.shutdown();
        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap_err(), AcquireError::Closed);
    }
}
