//! Bulk persistence engine.
//!
//! Converts task updates into store write requests, seals them into
//! size-bounded batches, submits the batches concurrently under a bounded
//! pool, and tracks failures in a registry retried by a periodic caller.
//! Writes are best-effort with bounded retries, never guaranteed delivery:
//! callers of [`BulkEngine::index`] only ever see configuration errors, at
//! construction time.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use taskmill_core::Task;
use taskmill_core::error::Result;
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::store::{DocumentStore, WriteRequest};

/// A sealed batch awaiting resubmission, keyed in the registry by a stable
/// batch id rather than by the batch value itself.
struct FailedBatch {
    requests: Vec<WriteRequest>,
    retries: u32,
}

/// Server-side engine that durably applies task upserts.
pub struct BulkEngine {
    store: Arc<dyn DocumentStore>,
    bulk_size_bytes: usize,
    max_retries: u32,
    pool: Arc<Semaphore>,
    failed: Mutex<HashMap<Uuid, FailedBatch>>,
}

impl std::fmt::Debug for BulkEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkEngine")
            .field("bulk_size_bytes", &self.bulk_size_bytes)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl BulkEngine {
    /// Creates an engine over the given store.
    ///
    /// # Errors
    ///
    /// Returns [`taskmill_core::MillError::Config`] when any threshold in
    /// `config` is non-positive.
    pub fn new(store: Arc<dyn DocumentStore>, config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            bulk_size_bytes: config.bulk_size_bytes,
            max_retries: config.max_index_retries,
            pool: Arc::new(Semaphore::new(config.indexing_threads)),
            failed: Mutex::new(HashMap::new()),
        })
    }

    /// Applies every (id, task) pair as an upsert into the named index.
    ///
    /// Blocks until every batch submitted for this call has completed, which
    /// is the caller's backpressure: it cannot race ahead of the store's
    /// write capacity. Batches from different calls interleave freely.
    /// Failures are registered for the periodic retry pass, not surfaced.
    pub async fn index(&self, tasks: &BTreeMap<String, Task>, index: &str) {
        let requests = self.create_requests(tasks, index);
        let batches = self.seal_batches(requests);
        let submissions = batches
            .into_iter()
            .map(|batch| self.submit(batch));
        join_all(submissions).await;
    }

    /// Resubmits every registered failed batch, incrementing its retry
    /// count. Invoked periodically, concurrently with live `index` calls.
    pub async fn retry_failed_requests(&self) {
        let drained: Vec<(Uuid, FailedBatch)> = {
            let mut failed = self.failed.lock().await;
            failed.drain().collect()
        };
        for (batch_id, batch) in drained {
            self.send_batch(batch_id, batch.requests, batch.retries + 1)
                .await;
        }
    }

    /// Number of batches currently awaiting retry.
    pub async fn failed_request_count(&self) -> usize {
        self.failed.lock().await.len()
    }

    fn create_requests(&self, tasks: &BTreeMap<String, Task>, index: &str) -> Vec<WriteRequest> {
        tasks
            .iter()
            .filter_map(|(id, task)| match serde_json::to_value(task) {
                Ok(doc) => Some(WriteRequest::new(index, id.clone(), doc)),
                Err(err) => {
                    tracing::error!("Couldn't encode task [{id}] for indexing: {err}");
                    None
                }
            })
            .collect()
    }

    /// Seals requests into batches: a batch closes once its estimated size
    /// passes the threshold, so each batch is at most one request past it.
    fn seal_batches(&self, requests: Vec<WriteRequest>) -> Vec<Vec<WriteRequest>> {
        let mut batches = Vec::new();
        let mut current = Vec::new();
        let mut current_size = 0usize;
        for request in requests {
            current_size += request.estimated_size_bytes();
            current.push(request);
            if current_size > self.bulk_size_bytes {
                batches.push(std::mem::take(&mut current));
                current_size = 0;
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    async fn submit(&self, batch: Vec<WriteRequest>) {
        let _permit = self
            .pool
            .acquire()
            .await
            .expect("bulk pool semaphore is never closed");
        self.send_batch(Uuid::new_v4(), batch, 0).await;
    }

    async fn send_batch(&self, batch_id: Uuid, requests: Vec<WriteRequest>, retry_num: u32) {
        let actions = requests.len();
        if retry_num > 0 {
            tracing::info!(
                "Batch [{batch_id}] of {actions} requests, retry {retry_num}/{}",
                self.max_retries
            );
        }
        let failure = match self.store.bulk(&requests).await {
            Ok(outcome) if outcome.failures.is_empty() => {
                tracing::debug!("Batch [{batch_id}] of {actions} requests finished successfully");
                None
            }
            Ok(outcome) => Some(format!(
                "{} item failures, first: [{}] {}",
                outcome.failures.len(),
                outcome.failures[0].id,
                outcome.failures[0].reason
            )),
            Err(err) => Some(err.to_string()),
        };

        if let Some(reason) = failure {
            if retry_num >= self.max_retries {
                tracing::error!(
                    "Reached maximum retry attempts for batch [{batch_id}] of {actions} requests. \
                     Tasks will not be indexed. Last error: {reason}"
                );
            } else {
                tracing::warn!(
                    "Failed to bulk index batch [{batch_id}] ({reason}). Going to retry."
                );
                self.failed.lock().await.insert(
                    batch_id,
                    FailedBatch {
                        requests,
                        retries: retry_num,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use taskmill_core::Event;

    fn engine_with(config: EngineConfig) -> (Arc<MemoryStore>, BulkEngine) {
        let store = Arc::new(MemoryStore::new());
        let engine = BulkEngine::new(store.clone(), &config).unwrap();
        (store, engine)
    }

    fn tasks(count: usize) -> BTreeMap<String, Task> {
        (0..count)
            .map(|i| {
                let id = format!("job___{i}");
                let event = Event::start(Some(id.clone()), "job");
                (id, Task::from_event(&event, 30))
            })
            .collect()
    }

    #[tokio::test]
    async fn index_upserts_every_task() {
        let (store, engine) = engine_with(EngineConfig::default());
        store.create_index("idx___000001", "idx").await.unwrap();

        engine.index(&tasks(10), "idx___000001").await;
        assert_eq!(store.doc_count("idx___000001").await, 10);
        assert_eq!(engine.failed_request_count().await, 0);
    }

    #[tokio::test]
    async fn oversized_calls_split_into_multiple_batches() {
        let config = EngineConfig {
            bulk_size_bytes: 1, // every request seals its own batch
            ..EngineConfig::default()
        };
        let (store, engine) = engine_with(config);
        store.create_index("idx___000001", "idx").await.unwrap();

        engine.index(&tasks(5), "idx___000001").await;
        assert_eq!(store.doc_count("idx___000001").await, 5);
    }

    #[tokio::test]
    async fn failed_batch_lands_in_registry_and_retries_on_next_pass() {
        let (store, engine) = engine_with(EngineConfig::default());
        store.create_index("idx___000001", "idx").await.unwrap();
        store.fail_next_bulks(1);

        engine.index(&tasks(3), "idx___000001").await;
        assert_eq!(engine.failed_request_count().await, 1);
        assert_eq!(store.doc_count("idx___000001").await, 0);

        engine.retry_failed_requests().await;
        assert_eq!(engine.failed_request_count().await, 0);
        assert_eq!(store.doc_count("idx___000001").await, 3);
    }

    #[tokio::test]
    async fn batch_is_dropped_after_exceeding_the_retry_ceiling() {
        let config = EngineConfig {
            max_index_retries: 2,
            ..EngineConfig::default()
        };
        let (store, engine) = engine_with(config);
        store.create_index("idx___000001", "idx").await.unwrap();
        // Initial attempt plus both retries fail.
        store.fail_next_bulks(3);

        engine.index(&tasks(1), "idx___000001").await;
        assert_eq!(engine.failed_request_count().await, 1);

        engine.retry_failed_requests().await; // retry 1, fails, re-registered
        assert_eq!(engine.failed_request_count().await, 1);
        engine.retry_failed_requests().await; // retry 2, fails, at ceiling
        assert_eq!(engine.failed_request_count().await, 0);
        assert_eq!(store.doc_count("idx___000001").await, 0);
    }

    #[tokio::test]
    async fn invalid_config_fails_construction() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let config = EngineConfig {
            indexing_threads: 0,
            ..EngineConfig::default()
        };
        assert!(BulkEngine::new(store, &config).unwrap_err().is_config());
    }
}
