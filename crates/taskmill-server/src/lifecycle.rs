//! Index lifecycle manager.
//!
//! Owns the current/old index pointers per alias, evaluates the rollover
//! condition, and, after a rollover, migrates still-partial tasks from the
//! retiring index into the new one. Migration order is write-then-delete:
//! a crash mid-migration leaves a task duplicated (safe, re-resolvable by
//! the dedup rule on read), never lost.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use chrono::Duration;
use taskmill_core::Task;
use tokio::sync::{Mutex, RwLock};

use crate::bulk::BulkEngine;
use crate::config::EngineConfig;
use crate::resolve::TaskResolver;
use crate::store::{DocumentStore, RolloverConditions, index_alias, index_name};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
struct AliasIndices {
    current: String,
    old: Option<String>,
}

/// Per-alias rollover and migration coordinator.
///
/// Cheap to clone; clones share state and locks.
#[derive(Clone)]
pub struct IndexLifecycleManager {
    store: Arc<dyn DocumentStore>,
    engine: Arc<BulkEngine>,
    resolver: Arc<TaskResolver>,
    conditions: RolloverConditions,
    max_migration_retries: u32,
    state: Arc<RwLock<HashMap<String, AliasIndices>>>,
    /// One lock per alias: a rollover/migration cycle holds it end to end,
    /// so two cycles can never race to move the same partial task. Writes
    /// themselves never take it.
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl IndexLifecycleManager {
    /// Creates a manager over the given store, engine and resolver.
    ///
    /// # Errors
    ///
    /// Returns [`taskmill_core::MillError::Config`] when any threshold in
    /// `config` is non-positive.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        engine: Arc<BulkEngine>,
        resolver: Arc<TaskResolver>,
        config: &EngineConfig,
    ) -> taskmill_core::error::Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            engine,
            resolver,
            conditions: RolloverConditions {
                max_age: Duration::days(config.max_index_age_days),
                max_size_bytes: config.max_index_size_gb * GIB,
                max_docs: config.max_index_docs,
            },
            max_migration_retries: config.max_migration_retries,
            state: Arc::new(RwLock::new(HashMap::new())),
            locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Ensures the alias for an environment exists, creating the initial
    /// index `<alias>___000001` on first write. Returns the alias name.
    ///
    /// For an alias that already exists in the store (a fresh process over
    /// existing data) the write pointer is recovered from the store so the
    /// alias participates in rollover and migration.
    pub async fn ensure_alias(&self, env: &str) -> Result<String> {
        let alias = index_alias(env);
        if !self.store.alias_exists(&alias).await? {
            let initial = index_name(&alias, 1);
            self.store.create_index(&initial, &alias).await?;
            tracing::info!("Created initial index [{initial}] for alias [{alias}]");
            self.state.write().await.insert(
                alias.clone(),
                AliasIndices {
                    current: initial,
                    old: None,
                },
            );
        } else if self.current_index(&alias).await.is_none() {
            if let Some(current) = self.store.current_index(&alias).await? {
                tracing::info!(
                    "Recovered current index [{current}] for existing alias [{alias}]"
                );
                self.state
                    .write()
                    .await
                    .insert(alias.clone(), AliasIndices { current, old: None });
            }
        }
        Ok(alias)
    }

    /// Index currently receiving writes for the alias, if known.
    pub async fn current_index(&self, alias: &str) -> Option<String> {
        self.state
            .read()
            .await
            .get(alias)
            .map(|indices| indices.current.clone())
    }

    /// Retiring index for the alias, if a rollover happened.
    pub async fn old_index(&self, alias: &str) -> Option<String> {
        self.state
            .read()
            .await
            .get(alias)
            .and_then(|indices| indices.old.clone())
    }

    /// Evaluates the rollover condition for the alias and, when the store
    /// rolls over, records the new current/old indices and spawns a
    /// detached migration of the old index's partial tasks.
    ///
    /// Skips silently when another rollover/migration cycle for the same
    /// alias is already running; this call never blocks the write path.
    pub async fn rollover(&self, alias: &str, flow_id: &str) {
        let lock = self.lock_for(alias).await;
        let Ok(guard) = lock.try_lock_owned() else {
            tracing::debug!(
                "[{flow_id}] Rollover cycle for alias [{alias}] already running, skipping"
            );
            return;
        };

        match self.store.rollover(alias, &self.conditions).await {
            Ok(Some(outcome)) => {
                tracing::info!(
                    "[{flow_id}] Index [{}] rolled over, new index is [{}]",
                    outcome.old_index,
                    outcome.new_index
                );
                self.state.write().await.insert(
                    alias.to_string(),
                    AliasIndices {
                        current: outcome.new_index.clone(),
                        old: Some(outcome.old_index.clone()),
                    },
                );

                // Migration runs detached so a slow copy never delays new
                // writes; it keeps the alias guard until it finishes.
                let manager = self.clone();
                let flow_id = flow_id.to_string();
                tokio::spawn(async move {
                    let _guard = guard;
                    manager
                        .migrate_with_retry(&outcome.old_index, &outcome.new_index, &flow_id)
                        .await;
                });
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(
                    "[{flow_id}] An error occurred while rolling over alias [{alias}]: {err}"
                );
            }
        }
    }

    /// Periodic merge-job entry point: re-checks rollover for every known
    /// alias (idle aliases still roll over) and sweeps partial tasks left
    /// in retiring indices forward into the current one.
    pub async fn migrate_partials(&self, flow_id: &str) {
        let aliases: Vec<String> = self.state.read().await.keys().cloned().collect();
        for alias in aliases {
            self.rollover(&alias, flow_id).await;

            let snapshot = self.state.read().await.get(&alias).cloned();
            let Some(AliasIndices {
                current,
                old: Some(old),
            }) = snapshot
            else {
                continue;
            };

            let lock = self.lock_for(&alias).await;
            let Ok(_guard) = lock.try_lock_owned() else {
                tracing::debug!(
                    "[{flow_id}] Migration for alias [{alias}] already running, skipping"
                );
                continue;
            };
            self.migrate_with_retry(&old, &current, flow_id).await;
        }
    }

    /// Re-indexes the given tasks into `new_index`, then deletes them from
    /// `old_index`, in that order: the migration's sole consistency
    /// mechanism.
    pub async fn index_and_delete(
        &self,
        tasks: &BTreeMap<String, Task>,
        new_index: &str,
        old_index: &str,
    ) {
        tracing::info!(
            "About to migrate {} partial tasks from old index [{old_index}] to new index [{new_index}]",
            tasks.len()
        );
        self.engine.index(tasks, new_index).await;
        self.resolver
            .delete_by_ids(tasks.keys().cloned().collect(), old_index.to_string());
        tracing::info!(
            "Successfully migrated {} tasks to new index [{new_index}]",
            tasks.len()
        );
    }

    async fn migrate_with_retry(&self, old_index: &str, new_index: &str, flow_id: &str) {
        // Attempt 0 is the initial try; the ceiling bounds the retries.
        for attempt in 0..=self.max_migration_retries {
            if attempt > 0 {
                tracing::warn!(
                    "[{flow_id}] Retry {attempt}/{} migrating tasks from old index [{old_index}]",
                    self.max_migration_retries
                );
            }
            match self.migrate_once(old_index, new_index).await {
                Ok(moved) => {
                    if moved > 0 {
                        tracing::info!(
                            "[{flow_id}] Migrated {moved} partial tasks from [{old_index}] to [{new_index}]"
                        );
                    }
                    return;
                }
                Err(err) => {
                    tracing::warn!(
                        "[{flow_id}] Failed to migrate tasks from old index [{old_index}]: {err}"
                    );
                }
            }
        }
        tracing::error!(
            "[{flow_id}] {} retries failed to migrate partial tasks from [{old_index}]; \
             those tasks are at risk of loss",
            self.max_migration_retries
        );
    }

    async fn migrate_once(&self, old_index: &str, new_index: &str) -> Result<usize> {
        let partial = self.resolver.fetch_partial(old_index).await?;
        if partial.is_empty() {
            return Ok(0);
        }
        let tasks: BTreeMap<String, Task> = partial.into_iter().collect();
        self.index_and_delete(&tasks, new_index, old_index).await;
        Ok(tasks.len())
    }

    async fn lock_for(&self, alias: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(alias.to_string()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use taskmill_core::Event;

    fn manager_with(
        config: EngineConfig,
    ) -> (Arc<MemoryStore>, Arc<BulkEngine>, IndexLifecycleManager) {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(BulkEngine::new(store.clone(), &config).unwrap());
        let resolver = Arc::new(TaskResolver::new(store.clone()));
        let manager =
            IndexLifecycleManager::new(store.clone(), engine.clone(), resolver, &config).unwrap();
        (store, engine, manager)
    }

    #[tokio::test]
    async fn ensure_alias_creates_the_initial_index_once() {
        let (store, _engine, manager) = manager_with(EngineConfig::default());
        let alias = manager.ensure_alias("prod").await.unwrap();
        assert_eq!(alias, "taskmill-prod");
        assert_eq!(
            manager.current_index(&alias).await.as_deref(),
            Some("taskmill-prod___000001")
        );

        // Idempotent: a second call creates nothing new.
        manager.ensure_alias("prod").await.unwrap();
        assert_eq!(store.indices_of(&alias).await.len(), 1);
    }

    #[tokio::test]
    async fn ensure_alias_recovers_the_write_pointer_from_an_existing_store() {
        let (store, _engine, manager) = manager_with(EngineConfig::default());
        // Data left behind by an earlier process: the alias is already on
        // its third index.
        for serial in 1..=3 {
            store
                .create_index(&index_name("taskmill-prod", serial), "taskmill-prod")
                .await
                .unwrap();
        }

        let alias = manager.ensure_alias("prod").await.unwrap();
        assert_eq!(
            manager.current_index(&alias).await.as_deref(),
            Some("taskmill-prod___000003")
        );
        // Recovery must not create a new index.
        assert_eq!(store.indices_of(&alias).await.len(), 3);
    }

    #[tokio::test]
    async fn rollover_below_conditions_is_a_no_op() {
        let (store, _engine, manager) = manager_with(EngineConfig::default());
        let alias = manager.ensure_alias("prod").await.unwrap();

        manager.rollover(&alias, "flow-1").await;
        assert_eq!(store.indices_of(&alias).await.len(), 1);
        assert!(manager.old_index(&alias).await.is_none());
    }

    #[tokio::test]
    async fn rollover_records_new_and_old_indices() {
        let config = EngineConfig {
            max_index_docs: 1,
            ..EngineConfig::default()
        };
        let (store, engine, manager) = manager_with(config);
        let alias = manager.ensure_alias("prod").await.unwrap();
        let current = manager.current_index(&alias).await.unwrap();

        // One terminal doc reaches the max-docs condition.
        let event = Event::success(Some("done___1".into()), "done");
        let mut tasks = BTreeMap::new();
        tasks.insert("done___1".to_string(), Task::from_event(&event, 30));
        engine.index(&tasks, &current).await;

        manager.rollover(&alias, "flow-2").await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            manager.current_index(&alias).await.as_deref(),
            Some("taskmill-prod___000002")
        );
        assert_eq!(manager.old_index(&alias).await.as_deref(), Some(current.as_str()));
        assert_eq!(store.indices_of(&alias).await.len(), 2);
    }
}
