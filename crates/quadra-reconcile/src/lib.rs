//! Quadra batch reconciliation.
//!
//! Takes a snapshot of upstream records and converges the local entity
//! store on it: records are partitioned into bounded batches, each batch
//! is one bulk upsert keyed by natural identity, and records whose
//! canonical content hash matches the cached hash of the previous run
//! are skipped without touching the store. Absence upstream is never a
//! delete signal; this module only ever writes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use quadra_core::Season;

pub mod memory;

/// Default number of records per bulk upsert
pub const DEFAULT_BATCH_SIZE: usize = 150;

/// Represents a content hash, format "sha256:<hex_digest>"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    /// Constructor validating the "sha256:" prefix and digest length
    pub fn new(hash_str: String) -> Result<Self, ReconcileError> {
        // sha256: + 64 hex chars
        if !hash_str.starts_with("sha256:") || hash_str.len() != 71 {
            return Err(ReconcileError::InvalidHashFormat(hash_str));
        }
        Ok(Self(hash_str))
    }

    /// Create a ContentHash directly from a string without validation
    pub(crate) fn new_unchecked(hash_str: String) -> Self {
        Self(hash_str)
    }

    /// Get the string representation of the hash
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to owned String
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical content hash of a JSON payload.
///
/// Object keys are serialized in sorted order at every depth, so two
/// payloads that differ only in key order hash equal.
pub fn hash_value(value: &Value) -> ContentHash {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    ContentHash::new_unchecked(format!("sha256:{}", hex::encode(hasher.finalize())))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // A JSON string produced by serde is always valid here.
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Errors that can occur during reconciliation
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The backing entity store failed
    #[error("Entity store error: {0}")]
    StoreError(String),

    /// A hash string did not match the expected format
    #[error("Invalid content hash format: {0}")]
    InvalidHashFormat(String),

    /// Payload (de)serialization failed
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Natural identity of an upstream record: the scope season plus the
/// upstream system's own id. Upsert filters match on this, never on a
/// locally generated id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    /// Academic season the record belongs to
    pub season: Season,

    /// Identifier assigned by the upstream system
    pub external_id: String,
}

impl NaturalKey {
    /// Create a natural key
    pub fn new(season: Season, external_id: impl Into<String>) -> Self {
        Self {
            season,
            external_id: external_id.into(),
        }
    }
}

impl Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.season, self.external_id)
    }
}

/// One upstream record to converge on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalRecord {
    /// Natural identity used as the upsert filter
    pub key: NaturalKey,

    /// Full upstream payload
    pub payload: Value,
}

impl ExternalRecord {
    /// Create a record
    pub fn new(key: NaturalKey, payload: Value) -> Self {
        Self { key, payload }
    }
}

/// A single record that failed inside an otherwise successful batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordError {
    /// Natural key of the failed record
    pub key: NaturalKey,

    /// What went wrong
    pub error: String,
}

/// Counts from one bulk upsert
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkUpsertOutcome {
    /// Records whose filter matched an existing entity
    pub matched: usize,

    /// Matched records whose stored payload actually changed
    pub modified: usize,

    /// Records inserted because no entity matched
    pub upserted: usize,

    /// Records rejected individually; siblings in the batch still land
    pub record_errors: Vec<RecordError>,
}

/// Store of locally persisted entities, written by natural key.
///
/// Implementations must give unordered batch semantics: one bad record
/// is reported in [`BulkUpsertOutcome::record_errors`] without blocking
/// its siblings. Entities are never deleted through this trait.
#[async_trait]
pub trait EntityStore: Send + Sync + std::fmt::Debug {
    /// Upsert every record in the slice, matching on natural key
    async fn bulk_upsert(
        &self,
        records: &[ExternalRecord],
    ) -> Result<BulkUpsertOutcome, ReconcileError>;

    /// Stored payload for a natural key, if present
    async fn get(&self, key: &NaturalKey) -> Result<Option<Value>, ReconcileError>;
}

/// Cache of the canonical content hash last written per natural key
#[async_trait]
pub trait HashCache: Send + Sync + std::fmt::Debug {
    /// Hash recorded for the key, if present and unexpired
    async fn get(&self, key: &NaturalKey) -> Option<ContentHash>;

    /// Record the hash for the key with the cache's TTL
    async fn put(&self, key: &NaturalKey, hash: ContentHash);
}

/// A whole batch that failed; contained records were not written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchError {
    /// Zero-based index of the batch in this run
    pub batch_index: usize,

    /// What went wrong
    pub error: String,
}

/// Result of one reconciliation run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Records examined (after in-input deduplication)
    pub processed_count: usize,

    /// Existing entities whose payload changed
    pub modified_count: usize,

    /// Entities newly inserted
    pub upserted_count: usize,

    /// Records skipped because their hash matched the cache
    pub skipped_count: usize,

    /// Batches that failed as a whole
    pub errors: Vec<BatchError>,

    /// Records rejected individually inside otherwise successful batches
    pub record_errors: Vec<RecordError>,
}

impl ReconcileReport {
    /// Whether every batch landed and every record was accepted
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.record_errors.is_empty()
    }
}

/// Converges the entity store on an upstream snapshot in bounded
/// batches, skipping records the hash cache proves unchanged.
#[derive(Debug, Clone)]
pub struct BatchReconciler {
    store: Arc<dyn EntityStore>,
    cache: Arc<dyn HashCache>,
    batch_size: usize,
}

impl BatchReconciler {
    /// Create a reconciler with the default batch size
    pub fn new(store: Arc<dyn EntityStore>, cache: Arc<dyn HashCache>) -> Self {
        Self::with_batch_size(store, cache, DEFAULT_BATCH_SIZE)
    }

    /// Create a reconciler with an explicit batch size (minimum 1)
    pub fn with_batch_size(
        store: Arc<dyn EntityStore>,
        cache: Arc<dyn HashCache>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            cache,
            batch_size: batch_size.max(1),
        }
    }

    /// Reconcile one upstream snapshot.
    ///
    /// Input is deduplicated by natural key (last write wins), then
    /// partitioned into contiguous batches of at most `batch_size`
    /// records. A failing batch is recorded in the report and later
    /// batches still run; records the store rejects individually are
    /// surfaced in `record_errors`. Empty input is a successful no-op.
    pub async fn reconcile(&self, records: Vec<ExternalRecord>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if records.is_empty() {
            return report;
        }

        let records = dedupe_last_wins(records);
        report.processed_count = records.len();

        // Partition into unchanged (cache hit) and pending writes.
        let mut pending: Vec<(ExternalRecord, ContentHash)> = Vec::new();
        for record in records {
            let hash = hash_value(&record.payload);
            if self.cache.get(&record.key).await.as_ref() == Some(&hash) {
                report.skipped_count += 1;
            } else {
                pending.push((record, hash));
            }
        }

        for (batch_index, batch) in pending.chunks(self.batch_size).enumerate() {
            let records: Vec<ExternalRecord> = batch.iter().map(|(r, _)| r.clone()).collect();

            match self.store.bulk_upsert(&records).await {
                Ok(outcome) => {
                    report.modified_count += outcome.modified;
                    report.upserted_count += outcome.upserted;

                    let failed: Vec<&NaturalKey> =
                        outcome.record_errors.iter().map(|e| &e.key).collect();
                    for error in &outcome.record_errors {
                        warn!(key = %error.key, error = %error.error, "Record rejected during bulk upsert");
                    }

                    // Only records that actually landed may refresh the cache.
                    for (record, hash) in batch {
                        if !failed.contains(&&record.key) {
                            self.cache.put(&record.key, hash.clone()).await;
                        }
                    }
                    report.record_errors.extend(outcome.record_errors);
                }
                Err(e) => {
                    warn!(batch_index, error = %e, "Batch upsert failed; continuing with later batches");
                    report.errors.push(BatchError {
                        batch_index,
                        error: e.to_string(),
                    });
                }
            }
        }

        debug!(
            processed = report.processed_count,
            modified = report.modified_count,
            upserted = report.upserted_count,
            skipped = report.skipped_count,
            failed_batches = report.errors.len(),
            failed_records = report.record_errors.len(),
            "Reconciliation run finished"
        );
        report
    }
}

/// Deduplicate by natural key keeping the last occurrence's payload,
/// preserving first-seen order.
fn dedupe_last_wins(records: Vec<ExternalRecord>) -> Vec<ExternalRecord> {
    let mut index: HashMap<NaturalKey, usize> = HashMap::new();
    let mut out: Vec<ExternalRecord> = Vec::with_capacity(records.len());

    for record in records {
        match index.get(&record.key) {
            Some(&i) => out[i] = record,
            None => {
                index.insert(record.key.clone(), out.len());
                out.push(record);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn key(id: &str) -> NaturalKey {
        NaturalKey::new(Season::new(2024, 3), id)
    }

    #[test]
    fn test_hash_ignores_key_order() {
        let a = json!({"code": "CS101", "credits": 4, "meta": {"x": 1, "y": 2}});
        let b = json!({"meta": {"y": 2, "x": 1}, "credits": 4, "code": "CS101"});
        assert_eq!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn test_hash_differs_on_content() {
        let a = json!({"code": "CS101"});
        let b = json!({"code": "CS102"});
        assert_ne!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn test_hash_format() {
        let hash = hash_value(&json!({"n": 1}));
        assert!(hash.as_str().starts_with("sha256:"));
        assert_eq!(hash.as_str().len(), 71);
        // Round-trips through the validating constructor.
        ContentHash::new(hash.clone().into_string()).unwrap();
    }

    #[test]
    fn test_content_hash_rejects_bad_format() {
        assert!(ContentHash::new("md5:abc".to_string()).is_err());
        assert!(ContentHash::new("sha256:short".to_string()).is_err());
    }

    #[test]
    fn test_dedupe_keeps_last_payload() {
        let records = vec![
            ExternalRecord::new(key("a"), json!(1)),
            ExternalRecord::new(key("b"), json!(2)),
            ExternalRecord::new(key("a"), json!(3)),
        ];

        let deduped = dedupe_last_wins(records);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].key, key("a"));
        assert_eq!(deduped[0].payload, json!(3));
        assert_eq!(deduped[1].payload, json!(2));
    }
}
