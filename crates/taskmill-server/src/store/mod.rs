//! Document store interface.
//!
//! The search backend is an external collaborator; the pipeline addresses it
//! only through [`DocumentStore`], a small set of index/alias/bulk/scroll/
//! delete-by-query primitives. [`memory::MemoryStore`] is the reference
//! implementation used by the integration tests.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use taskmill_core::task::TaskStatus;

pub use memory::MemoryStore;

/// Separates the alias from the serial in physical index names.
pub const INDEX_DELIMITER: &str = "___";

/// Physical index name for an alias and a monotonically increasing serial.
pub fn index_name(alias: &str, serial: u64) -> String {
    format!("{alias}{INDEX_DELIMITER}{serial:06}")
}

/// Logical alias for a tenant/environment tag.
pub fn index_alias(env: &str) -> String {
    format!("taskmill-{env}")
}

/// One upsert of a task document into a named index.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub index: String,
    pub id: String,
    pub doc: serde_json::Value,
    size_bytes: usize,
}

impl WriteRequest {
    pub fn new(index: impl Into<String>, id: impl Into<String>, doc: serde_json::Value) -> Self {
        let index = index.into();
        let id = id.into();
        let size_bytes = index.len() + id.len() + doc.to_string().len();
        Self {
            index,
            id,
            doc,
            size_bytes,
        }
    }

    /// Estimated encoded size, used for sealing bulk batches.
    pub fn estimated_size_bytes(&self) -> usize {
        self.size_bytes
    }
}

/// Per-item failure surfaced by a bulk call that was otherwise accepted.
#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub id: String,
    pub reason: String,
}

/// Result of a bulk call. An empty failure list means every item applied.
#[derive(Debug, Clone, Default)]
pub struct BulkOutcome {
    pub failures: Vec<ItemFailure>,
}

/// Rollover trigger thresholds, evaluated against the alias' current index.
#[derive(Debug, Clone, Copy)]
pub struct RolloverConditions {
    pub max_age: Duration,
    pub max_size_bytes: u64,
    pub max_docs: u64,
}

/// Outcome of a rollover the store actually performed.
#[derive(Debug, Clone)]
pub struct RolloverOutcome {
    pub old_index: String,
    pub new_index: String,
}

/// Closed set of queries the pipeline issues against the store.
#[derive(Debug, Clone)]
pub enum StoreQuery {
    /// Documents whose id is in the given set.
    Ids(Vec<String>),
    /// Task documents whose status is in the given set.
    StatusIn(Vec<TaskStatus>),
    /// Documents whose TTL instant (`meta.dateToDelete`) is at or before
    /// the given instant.
    ExpiredBefore(DateTime<Utc>),
}

/// One document returned by a scroll page.
#[derive(Debug, Clone)]
pub struct ScrollHit {
    pub index: String,
    pub id: String,
    pub source: serde_json::Value,
}

/// One page of a cursor-based scroll. `cursor` is `None` on the final page.
#[derive(Debug, Clone)]
pub struct ScrollPage {
    pub hits: Vec<ScrollHit>,
    pub cursor: Option<String>,
}

/// An abstract document store partitioned into aliased, rolling indices.
///
/// Implementations must be safe to share across tasks; every operation is
/// independent and the trait prescribes no transactional coupling between
/// them (the migration path relies solely on write-then-delete ordering).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Whether the given alias already points at an index.
    async fn alias_exists(&self, alias: &str) -> Result<bool>;

    /// Creates a physical index and points the alias at it.
    async fn create_index(&self, index: &str, alias: &str) -> Result<()>;

    /// The index currently receiving writes for an alias, or `None` when the
    /// alias does not exist.
    async fn current_index(&self, alias: &str) -> Result<Option<String>>;

    /// Applies a batch of upserts. Transport-level problems surface as
    /// `Err`; accepted batches report per-item failures in the outcome.
    async fn bulk(&self, requests: &[WriteRequest]) -> Result<BulkOutcome>;

    /// Rolls the alias over to a fresh index when any condition is met.
    /// Returns `None` when no condition was satisfied.
    async fn rollover(
        &self,
        alias: &str,
        conditions: &RolloverConditions,
    ) -> Result<Option<RolloverOutcome>>;

    /// Starts a scroll over `index` (or all indices when `None`).
    async fn scroll_start(
        &self,
        index: Option<&str>,
        query: &StoreQuery,
        page_size: usize,
    ) -> Result<ScrollPage>;

    /// Fetches the next page for a cursor returned by [`Self::scroll_start`].
    async fn scroll_next(&self, cursor: &str) -> Result<ScrollPage>;

    /// Deletes every document matching the query; returns the deleted count.
    async fn delete_by_query(&self, index: Option<&str>, query: &StoreQuery) -> Result<u64>;

    /// Installs the index template used by newly created indices.
    async fn put_index_template(&self, name: &str, body: serde_json::Value) -> Result<()>;

    /// Installs a stored update script used by upserts.
    async fn put_stored_script(&self, name: &str, body: serde_json::Value) -> Result<()>;
}

/// Installs the index template and stored script the pipeline expects.
/// Invoked once at startup, before any write.
pub async fn bootstrap(
    store: &dyn DocumentStore,
    number_of_shards: u32,
    number_of_replicas: u32,
) -> Result<()> {
    store
        .put_index_template(
            "taskmill-template",
            serde_json::json!({
                "index_patterns": ["taskmill*"],
                "settings": {
                    "number_of_shards": number_of_shards,
                    "number_of_replicas": number_of_replicas,
                },
            }),
        )
        .await?;
    store
        .put_stored_script(
            "taskmill-merge",
            serde_json::json!({
                "script": { "lang": "painless", "source": "ctx._source.putAll(params.task)" },
            }),
        )
        .await?;
    Ok(())
}
