//! Task resolution service.
//!
//! Reads task documents back out of the store: scroll-paged lookup by id
//! across one or all indices, deduplication of conflicting copies, repair of
//! numeric metric representation, and the partial/expired queries used by
//! the migration path and the expiration sweeper.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use taskmill_core::{Task, TaskStatus};

use crate::store::{DocumentStore, ScrollHit, StoreQuery};

/// Scroll page size for large result sets.
const SCROLL_PAGE_SIZE: usize = 10_000;

/// Read-side service over the document store.
pub struct TaskResolver {
    store: Arc<dyn DocumentStore>,
}

impl TaskResolver {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Fetches tasks by id from the given index, or from all indices when
    /// `index` is `None`, accumulating every scroll page before returning.
    ///
    /// When more than one document exists for an id (possible during a
    /// migration window) the state is inconsistent: the conflict is logged
    /// and the id omitted rather than guessing which copy is authoritative.
    pub async fn fetch_by_ids(
        &self,
        ids: &[String],
        index: Option<&str>,
    ) -> Result<HashMap<String, Task>> {
        let query = StoreQuery::Ids(ids.to_vec());
        let hits = self.run_scroll(index, &query).await?;
        Ok(Self::dedup_and_decode(hits))
    }

    /// Fetches every task in the index whose status is still non-terminal.
    /// Used exclusively by the rollover migration path.
    pub async fn fetch_partial(&self, index: &str) -> Result<HashMap<String, Task>> {
        let query = StoreQuery::StatusIn(TaskStatus::PARTIAL_SET.to_vec());
        let hits = self.run_scroll(Some(index), &query).await?;
        Ok(Self::dedup_and_decode(hits))
    }

    /// Deletes the given task ids from an index. Fire-and-forget: the caller
    /// does not wait, only the eventual deleted count is logged.
    pub fn delete_by_ids(&self, ids: Vec<String>, index: String) {
        let store = self.store.clone();
        tokio::spawn(async move {
            match store
                .delete_by_query(Some(&index), &StoreQuery::Ids(ids))
                .await
            {
                Ok(deleted) => {
                    tracing::info!("Deleted {deleted} tasks from index [{index}]");
                }
                Err(err) => {
                    tracing::warn!("Could not delete tasks from index [{index}]: {err}");
                }
            }
        });
    }

    /// Deletes every task document whose TTL has passed, across all indices
    /// and regardless of status. Fire-and-forget like [`Self::delete_by_ids`].
    pub fn delete_expired(&self) {
        tracing::info!("About to delete expired tasks");
        let store = self.store.clone();
        tokio::spawn(async move {
            match store
                .delete_by_query(None, &StoreQuery::ExpiredBefore(Utc::now()))
                .await
            {
                Ok(deleted) => tracing::info!("Deleted {deleted} expired tasks"),
                Err(err) => tracing::warn!("Could not delete expired tasks: {err}"),
            }
        });
    }

    async fn run_scroll(&self, index: Option<&str>, query: &StoreQuery) -> Result<Vec<ScrollHit>> {
        let mut page = self
            .store
            .scroll_start(index, query, SCROLL_PAGE_SIZE)
            .await?;
        let mut hits = page.hits;
        while let Some(cursor) = page.cursor {
            page = self.store.scroll_next(&cursor).await?;
            hits.append(&mut page.hits);
        }
        Ok(hits)
    }

    fn dedup_and_decode(hits: Vec<ScrollHit>) -> HashMap<String, Task> {
        let mut grouped: HashMap<String, Vec<ScrollHit>> = HashMap::new();
        for hit in hits {
            grouped.entry(hit.id.clone()).or_default().push(hit);
        }

        let mut tasks = HashMap::new();
        for (id, mut copies) in grouped {
            if copies.len() != 1 {
                let indices: Vec<&str> =
                    copies.iter().map(|hit| hit.index.as_str()).collect();
                tracing::warn!(
                    "Fetched multiple documents for task id [{id}] (indices {indices:?}); \
                     omitting it from the result"
                );
                continue;
            }
            let mut source = copies.remove(0).source;
            fix_metrics(&mut source);
            match serde_json::from_value::<Task>(source) {
                Ok(task) => {
                    tasks.insert(id, task);
                }
                Err(err) => {
                    tracing::error!("Couldn't decode task document [{id}]: {err}");
                }
            }
        }
        tasks
    }
}

/// Repairs lazily-typed metric numbers in a raw task document: a decimal
/// point in the literal makes the value a float, anything else an integer.
fn fix_metrics(source: &mut serde_json::Value) {
    let Some(metrics) = source.get_mut("metric").and_then(serde_json::Value::as_object_mut)
    else {
        return;
    };
    for value in metrics.values_mut() {
        let serde_json::Value::Number(number) = value else {
            continue;
        };
        let repaired = if number.to_string().contains('.') {
            number.as_f64().and_then(serde_json::Number::from_f64)
        } else {
            number.as_i64().map(serde_json::Number::from)
        };
        // Values outside both representations stay as they were.
        if let Some(repaired) = repaired {
            *value = serde_json::Value::Number(repaired);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, WriteRequest};
    use serde_json::json;

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.create_index("idx___000001", "idx").await.unwrap();
        store.create_index("idx___000002", "idx").await.unwrap();
        store
    }

    #[tokio::test]
    async fn fetch_by_ids_returns_decoded_tasks() {
        let store = seeded_store().await;
        store
            .bulk(&[WriteRequest::new(
                "idx___000002",
                "job___1",
                json!({"status": "UNTERMINATED", "name": "job"}),
            )])
            .await
            .unwrap();

        let resolver = TaskResolver::new(store);
        let tasks = resolver
            .fetch_by_ids(&["job___1".to_string()], None)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks["job___1"].status, TaskStatus::Unterminated);
    }

    #[tokio::test]
    async fn duplicate_documents_are_omitted_not_guessed() {
        let store = seeded_store().await;
        for index in ["idx___000001", "idx___000002"] {
            store
                .bulk(&[WriteRequest::new(
                    index,
                    "job___dup",
                    json!({"status": "UNTERMINATED"}),
                )])
                .await
                .unwrap();
        }

        let resolver = TaskResolver::new(store);
        let tasks = resolver
            .fetch_by_ids(&["job___dup".to_string()], None)
            .await
            .unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn fetch_partial_skips_terminal_tasks() {
        let store = seeded_store().await;
        store
            .bulk(&[
                WriteRequest::new("idx___000001", "a", json!({"status": "UNTERMINATED"})),
                WriteRequest::new("idx___000001", "b", json!({"status": "PARTIAL_SUCCESS"})),
                WriteRequest::new("idx___000001", "c", json!({"status": "SUCCESS"})),
            ])
            .await
            .unwrap();

        let resolver = TaskResolver::new(store);
        let partial = resolver.fetch_partial("idx___000001").await.unwrap();
        assert_eq!(partial.len(), 2);
        assert!(partial.contains_key("a"));
        assert!(partial.contains_key("b"));
    }

    #[test]
    fn metric_repair_follows_the_literal_text() {
        let mut doc = json!({
            "metric": {"count": 3, "ratio": 3.5, "whole": 3.0}
        });
        fix_metrics(&mut doc);
        let metrics = doc["metric"].as_object().unwrap();
        assert!(metrics["count"].is_i64());
        assert!(metrics["ratio"].is_f64());
        // A literal with a decimal point stays floating-point even when the
        // value is whole.
        assert!(metrics["whole"].is_f64());
    }

    #[tokio::test]
    async fn delete_expired_removes_only_past_ttl() {
        let store = seeded_store().await;
        let past = Utc::now() - chrono::Duration::days(2);
        let future = Utc::now() + chrono::Duration::days(2);
        store
            .bulk(&[
                WriteRequest::new(
                    "idx___000001",
                    "old",
                    json!({"status": "SUCCESS", "meta": {"dateToDelete": past.to_rfc3339()}}),
                ),
                WriteRequest::new(
                    "idx___000001",
                    "new",
                    json!({"status": "SUCCESS", "meta": {"dateToDelete": future.to_rfc3339()}}),
                ),
            ])
            .await
            .unwrap();

        let resolver = TaskResolver::new(store.clone());
        resolver.delete_expired();
        // The deletion task is detached; let it run.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        assert!(store.get("idx___000001", "old").await.is_none());
        assert!(store.get("idx___000001", "new").await.is_some());
    }
}
