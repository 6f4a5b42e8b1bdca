//! Distributed TTL locks for the Quadra sync platform.
//!
//! This crate provides a pluggable lock service used to guarantee that
//! at most one reconciliation run per scope is in flight at a time.
//! Locks always carry a TTL so a crashed holder can never wedge a scope
//! permanently.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Errors produced by lock services
#[derive(Error, Debug)]
pub enum LockError {
    /// The backing store failed or is unreachable
    #[error("Lock backend error: {0}")]
    BackendError(String),

    /// The configured lock URL has no matching implementation
    #[error("Unsupported lock service URL: {0}")]
    UnsupportedUrl(String),
}

/// A service handing out mutual-exclusion leases keyed by string
#[async_trait]
pub trait LockService: Send + Sync + std::fmt::Debug {
    /// Try to acquire the lock for `key` with the given TTL. Returns
    /// `true` if this caller now holds the lock, `false` if someone
    /// else holds an unexpired lease.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Release the lock for `key`. Returns `true` if a live lease was
    /// removed, `false` if there was nothing to release.
    async fn release(&self, key: &str) -> Result<bool, LockError>;

    /// Whether `key` is currently held by an unexpired lease
    async fn is_held(&self, key: &str) -> Result<bool, LockError>;

    /// Health check
    async fn health_check(&self) -> Result<bool, LockError> {
        Ok(true)
    }
}

/// One live lease in the in-memory store
#[derive(Debug)]
struct LockEntry {
    /// Opaque holder token, kept for diagnostics
    #[allow(dead_code)]
    token: String,

    /// When the lease lapses
    expires_at: Instant,
}

impl LockEntry {
    fn new(ttl: Duration) -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory implementation of [`LockService`].
///
/// Expired leases are treated as absent on every read path; a
/// background task additionally sweeps them out so abandoned keys do
/// not accumulate.
#[derive(Debug)]
pub struct InMemoryLockService {
    locks: Arc<RwLock<HashMap<String, LockEntry>>>,
}

impl InMemoryLockService {
    /// Create a new in-memory lock service and start its sweep task
    pub fn new() -> Self {
        info!("Creating in-memory lock service");
        let locks: Arc<RwLock<HashMap<String, LockEntry>>> = Arc::new(RwLock::new(HashMap::new()));

        tokio::spawn({
            let locks = locks.clone();
            async move {
                Self::sweep_task(locks).await;
            }
        });

        Self { locks }
    }

    /// Background task that periodically removes expired leases
    async fn sweep_task(locks: Arc<RwLock<HashMap<String, LockEntry>>>) {
        let mut interval = time::interval(Duration::from_secs(30));

        loop {
            interval.tick().await;

            let mut guard = locks.write().await;
            let expired: Vec<String> = guard
                .iter()
                .filter(|(_, entry)| entry.is_expired())
                .map(|(key, _)| key.clone())
                .collect();

            for key in &expired {
                guard.remove(key);
            }

            if !expired.is_empty() {
                debug!("Lock sweep removed {} expired leases", expired.len());
            }
        }
    }
}

impl Default for InMemoryLockService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut locks = self.locks.write().await;

        if let Some(entry) = locks.get(key) {
            if !entry.is_expired() {
                debug!(key, "Lock acquisition lost: lease already held");
                return Ok(false);
            }
        }

        locks.insert(key.to_string(), LockEntry::new(ttl));
        debug!(key, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<bool, LockError> {
        let mut locks = self.locks.write().await;

        match locks.remove(key) {
            Some(entry) => {
                debug!(key, "Lock released");
                Ok(!entry.is_expired())
            }
            None => Ok(false),
        }
    }

    async fn is_held(&self, key: &str) -> Result<bool, LockError> {
        let locks = self.locks.read().await;
        Ok(locks.get(key).map(|e| !e.is_expired()).unwrap_or(false))
    }
}

// Redis implementation if the redis feature is enabled
#[cfg(feature = "redis")]
pub mod redis {
    use super::*;
    use ::redis::aio::ConnectionManager;
    use ::redis::{Client, RedisError};
    use tokio::sync::Mutex;

    const CONNECTION_TIMEOUT_MS: u64 = 3000;

    /// Redis implementation of [`LockService`] built on `SET NX PX`.
    ///
    /// The TTL lives in Redis itself, so expiry works even if the
    /// holding process dies.
    pub struct RedisLockService {
        manager: Mutex<ConnectionManager>,
    }

    impl std::fmt::Debug for RedisLockService {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RedisLockService").finish_non_exhaustive()
        }
    }

    impl RedisLockService {
        /// Connect to Redis at the given URL
        pub async fn new(redis_url: &str) -> Result<Self, RedisError> {
            info!("Creating Redis lock service with URL: {}", redis_url);
            let client = Client::open(redis_url)?;
            let manager = ConnectionManager::new(client).await?;
            Ok(Self {
                manager: Mutex::new(manager),
            })
        }

        /// Namespaced Redis key for a lock
        fn make_key(key: &str) -> String {
            format!("quadra:lock:{}", key)
        }
    }

    #[async_trait]
    impl LockService for RedisLockService {
        async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
            let redis_key = Self::make_key(key);
            let token = Uuid::new_v4().to_string();
            let ttl_ms = ttl.as_millis().max(1) as u64;

            let mut conn = self.manager.lock().await;
            let result: Option<String> = ::redis::cmd("SET")
                .arg(&redis_key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut *conn)
                .await
                .map_err(|e| LockError::BackendError(format!("Redis SET error: {}", e)))?;

            let acquired = result.is_some();
            debug!(key, acquired, "Redis lock acquisition");
            Ok(acquired)
        }

        async fn release(&self, key: &str) -> Result<bool, LockError> {
            let redis_key = Self::make_key(key);

            let mut conn = self.manager.lock().await;
            let removed: u64 = ::redis::cmd("DEL")
                .arg(&redis_key)
                .query_async(&mut *conn)
                .await
                .map_err(|e| LockError::BackendError(format!("Redis DEL error: {}", e)))?;

            Ok(removed > 0)
        }

        async fn is_held(&self, key: &str) -> Result<bool, LockError> {
            let redis_key = Self::make_key(key);

            let mut conn = self.manager.lock().await;
            let exists: bool = ::redis::cmd("EXISTS")
                .arg(&redis_key)
                .query_async(&mut *conn)
                .await
                .map_err(|e| LockError::BackendError(format!("Redis EXISTS error: {}", e)))?;

            Ok(exists)
        }

        async fn health_check(&self) -> Result<bool, LockError> {
            let mut conn = self.manager.lock().await;
            let ping: String = match time::timeout(
                Duration::from_millis(CONNECTION_TIMEOUT_MS),
                ::redis::cmd("PING").query_async(&mut *conn),
            )
            .await
            {
                Ok(Ok(pong)) => pong,
                Ok(Err(e)) => {
                    error!("Redis lock health check failed: {}", e);
                    return Err(LockError::BackendError(format!("Redis ping error: {}", e)));
                }
                Err(_) => {
                    error!(
                        "Redis lock health check timed out after {}ms",
                        CONNECTION_TIMEOUT_MS
                    );
                    return Err(LockError::BackendError(format!(
                        "Redis ping timed out after {}ms",
                        CONNECTION_TIMEOUT_MS
                    )));
                }
            };

            Ok(ping == "PONG")
        }
    }
}

/// Factory function to create a [`LockService`] based on URL
pub async fn create_lock_service(url: &str) -> Result<Arc<dyn LockService>, LockError> {
    if url.starts_with("memory://") {
        info!("Creating in-memory lock service");
        Ok(Arc::new(InMemoryLockService::new()))
    } else if url.starts_with("redis://") {
        #[cfg(feature = "redis")]
        {
            let service = redis::RedisLockService::new(url)
                .await
                .map_err(|e| LockError::BackendError(format!("Redis init error: {}", e)))?;
            Ok(Arc::new(service))
        }

        #[cfg(not(feature = "redis"))]
        {
            error!("Redis lock service requested but 'redis' feature not enabled");
            Err(LockError::UnsupportedUrl(
                "Redis lock service requested but 'redis' feature not enabled".to_string(),
            ))
        }
    } else {
        error!("Unsupported lock service URL: {}", url);
        Err(LockError::UnsupportedUrl(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_acquire_then_contend() {
        let locks = InMemoryLockService::new();

        assert!(locks.acquire("sync:components:2024:3", Duration::from_secs(60)).await.unwrap());
        assert!(!locks.acquire("sync:components:2024:3", Duration::from_secs(60)).await.unwrap());
        assert!(locks.is_held("sync:components:2024:3").await.unwrap());

        // A different key is unaffected.
        assert!(locks.acquire("sync:components:2025:1", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_allows_reacquire() {
        let locks = InMemoryLockService::new();

        assert!(locks.acquire("scope", Duration::from_secs(60)).await.unwrap());
        assert!(locks.release("scope").await.unwrap());
        assert!(!locks.is_held("scope").await.unwrap());
        assert!(locks.acquire("scope", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_without_lease_is_false() {
        let locks = InMemoryLockService::new();
        assert!(!locks.release("nothing").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_reacquired() {
        let locks = InMemoryLockService::new();

        assert!(locks.acquire("scope", Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!locks.is_held("scope").await.unwrap());
        assert!(locks.acquire("scope", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_acquirers_have_one_winner() {
        let locks = Arc::new(InMemoryLockService::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks.acquire("contended", Duration::from_secs(60)).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_factory_memory_url() {
        let locks = create_lock_service("memory://").await.unwrap();
        assert!(locks.acquire("scope", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_factory_rejects_unknown_scheme() {
        let err = create_lock_service("postgres://nope").await.unwrap_err();
        assert!(matches!(err, LockError::UnsupportedUrl(_)));
    }
}
