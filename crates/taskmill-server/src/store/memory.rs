//! In-memory [`DocumentStore`] implementation.
//!
//! Reference backend for tests and embedded use. Documents live in plain
//! maps keyed by index and id; rollover, scrolling and delete-by-query
//! follow the same observable semantics the pipeline expects from a real
//! search backend.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    BulkOutcome, DocumentStore, INDEX_DELIMITER, RolloverConditions, RolloverOutcome, ScrollHit,
    ScrollPage, StoreQuery, WriteRequest, index_name,
};

#[derive(Default)]
struct Inner {
    /// alias -> physical indices, oldest first; the last entry is current.
    aliases: HashMap<String, Vec<String>>,
    /// index -> id -> document.
    docs: HashMap<String, BTreeMap<String, serde_json::Value>>,
    created_at: HashMap<String, DateTime<Utc>>,
    scrolls: HashMap<String, (VecDeque<ScrollHit>, usize)>,
    templates: HashMap<String, serde_json::Value>,
    scripts: HashMap<String, serde_json::Value>,
}

/// In-memory document store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    /// When non-zero, that many upcoming bulk calls fail at transport level.
    fail_bulks: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` bulk calls fail with a transport error.
    pub fn fail_next_bulks(&self, n: u32) {
        self.fail_bulks.store(n, Ordering::SeqCst);
    }

    /// Fetches one document directly, bypassing the query layer.
    pub async fn get(&self, index: &str, id: &str) -> Option<serde_json::Value> {
        self.inner
            .read()
            .await
            .docs
            .get(index)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Number of documents held by an index.
    pub async fn doc_count(&self, index: &str) -> usize {
        self.inner
            .read()
            .await
            .docs
            .get(index)
            .map_or(0, BTreeMap::len)
    }

    /// All physical indices behind an alias, oldest first.
    pub async fn indices_of(&self, alias: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .aliases
            .get(alias)
            .cloned()
            .unwrap_or_default()
    }

    /// Backdates an index's creation instant (test hook for age rollover).
    pub async fn set_index_created_at(&self, index: &str, created_at: DateTime<Utc>) {
        self.inner
            .write()
            .await
            .created_at
            .insert(index.to_string(), created_at);
    }

    /// Installed index template, if any.
    pub async fn template(&self, name: &str) -> Option<serde_json::Value> {
        self.inner.read().await.templates.get(name).cloned()
    }

    /// Installed stored script, if any.
    pub async fn script(&self, name: &str) -> Option<serde_json::Value> {
        self.inner.read().await.scripts.get(name).cloned()
    }
}

fn status_matches(doc: &serde_json::Value, statuses: &[taskmill_core::TaskStatus]) -> bool {
    let Some(actual) = doc.get("status").and_then(serde_json::Value::as_str) else {
        return false;
    };
    statuses.iter().any(|status| {
        serde_json::to_value(status)
            .ok()
            .and_then(|v| v.as_str().map(|s| s == actual))
            .unwrap_or(false)
    })
}

fn expired_matches(doc: &serde_json::Value, deadline: &DateTime<Utc>) -> bool {
    doc.get("meta")
        .and_then(|meta| meta.get("dateToDelete"))
        .and_then(serde_json::Value::as_str)
        .and_then(|raw| raw.parse::<DateTime<Utc>>().ok())
        .is_some_and(|ttl| ttl <= *deadline)
}

fn query_matches(id: &str, doc: &serde_json::Value, query: &StoreQuery) -> bool {
    match query {
        StoreQuery::Ids(ids) => ids.iter().any(|candidate| candidate == id),
        StoreQuery::StatusIn(statuses) => status_matches(doc, statuses),
        StoreQuery::ExpiredBefore(deadline) => expired_matches(doc, deadline),
    }
}

impl Inner {
    fn collect_hits(&self, index: Option<&str>, query: &StoreQuery) -> VecDeque<ScrollHit> {
        let mut hits = VecDeque::new();
        for (index_name, docs) in &self.docs {
            if index.is_some_and(|wanted| wanted != index_name) {
                continue;
            }
            for (id, doc) in docs {
                if query_matches(id, doc, query) {
                    hits.push_back(ScrollHit {
                        index: index_name.clone(),
                        id: id.clone(),
                        source: doc.clone(),
                    });
                }
            }
        }
        hits
    }

    fn next_serial(&self, current_index: &str) -> u64 {
        current_index
            .rsplit(INDEX_DELIMITER)
            .next()
            .and_then(|serial| serial.parse::<u64>().ok())
            .map_or(1, |serial| serial + 1)
    }

    fn take_page(hits: &mut VecDeque<ScrollHit>, page_size: usize) -> Vec<ScrollHit> {
        let take = page_size.min(hits.len());
        hits.drain(..take).collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn alias_exists(&self, alias: &str) -> Result<bool> {
        Ok(self.inner.read().await.aliases.contains_key(alias))
    }

    async fn create_index(&self, index: &str, alias: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .aliases
            .entry(alias.to_string())
            .or_default()
            .push(index.to_string());
        inner.docs.entry(index.to_string()).or_default();
        inner.created_at.insert(index.to_string(), Utc::now());
        Ok(())
    }

    async fn current_index(&self, alias: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .read()
            .await
            .aliases
            .get(alias)
            .and_then(|indices| indices.last().cloned()))
    }

    async fn bulk(&self, requests: &[WriteRequest]) -> Result<BulkOutcome> {
        if self.fail_bulks.load(Ordering::SeqCst) > 0 {
            self.fail_bulks.fetch_sub(1, Ordering::SeqCst);
            bail!("injected bulk transport failure");
        }
        let mut inner = self.inner.write().await;
        for request in requests {
            inner
                .docs
                .entry(request.index.clone())
                .or_default()
                .insert(request.id.clone(), request.doc.clone());
            inner
                .created_at
                .entry(request.index.clone())
                .or_insert_with(Utc::now);
        }
        Ok(BulkOutcome::default())
    }

    async fn rollover(
        &self,
        alias: &str,
        conditions: &RolloverConditions,
    ) -> Result<Option<RolloverOutcome>> {
        let mut inner = self.inner.write().await;
        let current = inner
            .aliases
            .get(alias)
            .and_then(|indices| indices.last())
            .cloned()
            .ok_or_else(|| anyhow!("alias [{alias}] does not exist"))?;

        let docs = inner.docs.get(&current).map_or(0, BTreeMap::len) as u64;
        let size: u64 = inner
            .docs
            .get(&current)
            .map(|docs| docs.values().map(|d| d.to_string().len() as u64).sum())
            .unwrap_or(0);
        let age = inner
            .created_at
            .get(&current)
            .map(|created| Utc::now() - *created)
            .unwrap_or_else(chrono::Duration::zero);

        let satisfied = age >= conditions.max_age
            || size >= conditions.max_size_bytes
            || docs >= conditions.max_docs;
        if !satisfied {
            return Ok(None);
        }

        let new_index = index_name(alias, inner.next_serial(&current));
        inner
            .aliases
            .get_mut(alias)
            .expect("alias checked above")
            .push(new_index.clone());
        inner.docs.entry(new_index.clone()).or_default();
        inner.created_at.insert(new_index.clone(), Utc::now());

        Ok(Some(RolloverOutcome {
            old_index: current,
            new_index,
        }))
    }

    async fn scroll_start(
        &self,
        index: Option<&str>,
        query: &StoreQuery,
        page_size: usize,
    ) -> Result<ScrollPage> {
        let mut inner = self.inner.write().await;
        let mut hits = inner.collect_hits(index, query);
        let page = Inner::take_page(&mut hits, page_size);
        let cursor = if hits.is_empty() {
            None
        } else {
            let cursor = Uuid::new_v4().to_string();
            inner.scrolls.insert(cursor.clone(), (hits, page_size));
            Some(cursor)
        };
        Ok(ScrollPage { hits: page, cursor })
    }

    async fn scroll_next(&self, cursor: &str) -> Result<ScrollPage> {
        let mut inner = self.inner.write().await;
        let (mut hits, page_size) = inner
            .scrolls
            .remove(cursor)
            .ok_or_else(|| anyhow!("unknown scroll cursor [{cursor}]"))?;
        let page = Inner::take_page(&mut hits, page_size);
        let cursor = if hits.is_empty() {
            None
        } else {
            inner
                .scrolls
                .insert(cursor.to_string(), (hits, page_size));
            Some(cursor.to_string())
        };
        Ok(ScrollPage { hits: page, cursor })
    }

    async fn delete_by_query(&self, index: Option<&str>, query: &StoreQuery) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let mut deleted = 0u64;
        for (index_name, docs) in inner.docs.iter_mut() {
            if index.is_some_and(|wanted| wanted != index_name) {
                continue;
            }
            let before = docs.len();
            docs.retain(|id, doc| !query_matches(id, doc, query));
            deleted += (before - docs.len()) as u64;
        }
        Ok(deleted)
    }

    async fn put_index_template(&self, name: &str, body: serde_json::Value) -> Result<()> {
        self.inner
            .write()
            .await
            .templates
            .insert(name.to_string(), body);
        Ok(())
    }

    async fn put_stored_script(&self, name: &str, body: serde_json::Value) -> Result<()> {
        self.inner
            .write()
            .await
            .scripts
            .insert(name.to_string(), body);
        Ok(())
    }
}
