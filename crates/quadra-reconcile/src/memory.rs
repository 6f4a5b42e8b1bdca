//! In-memory implementations of [`EntityStore`] and [`HashCache`]
//!
//! Primarily intended for testing and single-process deployments. All
//! data is lost when the instance is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    BulkUpsertOutcome, ContentHash, EntityStore, ExternalRecord, HashCache, NaturalKey,
    ReconcileError, RecordError,
};

/// Default lifetime of a cached content hash
pub const DEFAULT_HASH_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// In-memory implementation of [`EntityStore`].
///
/// Payloads are stored verbatim keyed by natural key. `Null` payloads
/// are rejected per record; the rest of the batch still lands.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEntityStore {
    entities: Arc<RwLock<HashMap<NaturalKey, Value>>>,
}

impl InMemoryEntityStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities
    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }

    /// Whether the store holds no entities
    pub async fn is_empty(&self) -> bool {
        self.entities.read().await.is_empty()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn bulk_upsert(
        &self,
        records: &[ExternalRecord],
    ) -> Result<BulkUpsertOutcome, ReconcileError> {
        let mut entities = self.entities.write().await;
        let mut outcome = BulkUpsertOutcome::default();

        for record in records {
            if record.payload.is_null() {
                outcome.record_errors.push(RecordError {
                    key: record.key.clone(),
                    error: "null payload".to_string(),
                });
                continue;
            }

            match entities.get(&record.key) {
                Some(existing) => {
                    outcome.matched += 1;
                    if *existing != record.payload {
                        entities.insert(record.key.clone(), record.payload.clone());
                        outcome.modified += 1;
                    }
                }
                None => {
                    entities.insert(record.key.clone(), record.payload.clone());
                    outcome.upserted += 1;
                }
            }
        }

        debug!(
            records = records.len(),
            matched = outcome.matched,
            modified = outcome.modified,
            upserted = outcome.upserted,
            "Bulk upsert applied"
        );
        Ok(outcome)
    }

    async fn get(&self, key: &NaturalKey) -> Result<Option<Value>, ReconcileError> {
        Ok(self.entities.read().await.get(key).cloned())
    }
}

#[derive(Debug)]
struct CacheEntry {
    hash: ContentHash,
    expires_at: Instant,
}

/// In-memory implementation of [`HashCache`] with per-entry TTL
#[derive(Debug)]
pub struct InMemoryHashCache {
    entries: Arc<RwLock<HashMap<NaturalKey, CacheEntry>>>,
    ttl: Duration,
}

impl InMemoryHashCache {
    /// Create a cache with the default 24 h TTL
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_HASH_TTL)
    }

    /// Create a cache with an explicit TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }
}

impl Default for InMemoryHashCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HashCache for InMemoryHashCache {
    async fn get(&self, key: &NaturalKey) -> Option<ContentHash> {
        let entries = self.entries.read().await;
        entries.get(key).and_then(|entry| {
            if Instant::now() < entry.expires_at {
                Some(entry.hash.clone())
            } else {
                None
            }
        })
    }

    async fn put(&self, key: &NaturalKey, hash: ContentHash) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.clone(),
            CacheEntry {
                hash,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }
}
