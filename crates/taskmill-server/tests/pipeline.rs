//! End-to-end persistence tests against the in-memory store: rollover,
//! partial-task migration, and cross-index resolution.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use taskmill_core::{Event, Task, TaskStatus};
use taskmill_server::config::EngineConfig;
use taskmill_server::store::{DocumentStore, WriteRequest};
use taskmill_server::{BulkEngine, IndexLifecycleManager, MemoryStore, TaskResolver};

struct Harness {
    store: Arc<MemoryStore>,
    engine: Arc<BulkEngine>,
    resolver: Arc<TaskResolver>,
    manager: IndexLifecycleManager,
}

fn harness(config: EngineConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(BulkEngine::new(store.clone(), &config).unwrap());
    let resolver = Arc::new(TaskResolver::new(store.clone()));
    let manager =
        IndexLifecycleManager::new(store.clone(), engine.clone(), resolver.clone(), &config)
            .unwrap();
    Harness {
        store,
        engine,
        resolver,
        manager,
    }
}

fn unterminated_task(id: &str) -> (String, Task) {
    let event = Event::start(Some(id.to_string()), "job");
    (id.to_string(), Task::from_event(&event, 30))
}

/// Polls until the condition holds, yielding to detached tasks in between.
async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn rollover_scenario_moves_unterminated_task_to_new_index() {
    let config = EngineConfig {
        max_index_docs: 1,
        ..EngineConfig::default()
    };
    let h = harness(config);
    let alias = h.manager.ensure_alias("test").await.unwrap();
    let first_index = h.manager.current_index(&alias).await.unwrap();

    // First write fills the index up to the doc-count ceiling.
    let tasks: BTreeMap<String, Task> = [unterminated_task("job___partial")].into();
    h.engine.index(&tasks, &first_index).await;

    // The second write's rollover check trips the condition.
    h.manager.rollover(&alias, "flow-test").await;

    let new_index = h.manager.current_index(&alias).await.unwrap();
    assert_ne!(new_index, first_index);
    assert_eq!(h.manager.old_index(&alias).await.as_deref(), Some(first_index.as_str()));

    // The detached migration re-indexes the partial task into the new
    // index and deletes it from the old one.
    let store = h.store.clone();
    let (old, new) = (first_index.clone(), new_index.clone());
    wait_until(move || {
        let store = store.clone();
        let (old, new) = (old.clone(), new.clone());
        async move {
            store.get(&new, "job___partial").await.is_some()
                && store.get(&old, "job___partial").await.is_none()
        }
    })
    .await;
}

#[tokio::test]
async fn migration_interrupted_before_delete_leaves_task_in_both_indices() {
    let h = harness(EngineConfig::default());
    h.store.create_index("al___000001", "al").await.unwrap();
    h.store.create_index("al___000002", "al").await.unwrap();

    let tasks: BTreeMap<String, Task> = [unterminated_task("job___x")].into();
    h.engine.index(&tasks, "al___000001").await;

    // Simulate a crash after the copy but before the delete: only the
    // re-index half of the migration runs.
    h.engine.index(&tasks, "al___000002").await;

    assert!(h.store.get("al___000001", "job___x").await.is_some());
    assert!(h.store.get("al___000002", "job___x").await.is_some());

    // Duplicated state is re-resolvable, never guessed: the resolver omits
    // the conflicting id instead of returning either copy.
    let fetched = h
        .resolver
        .fetch_by_ids(&["job___x".to_string()], None)
        .await
        .unwrap();
    assert!(fetched.is_empty());
}

#[tokio::test]
async fn completed_migration_leaves_task_only_in_the_new_index() {
    let h = harness(EngineConfig::default());
    h.store.create_index("al___000001", "al").await.unwrap();
    h.store.create_index("al___000002", "al").await.unwrap();

    let tasks: BTreeMap<String, Task> = [unterminated_task("job___y")].into();
    h.engine.index(&tasks, "al___000001").await;

    h.manager
        .index_and_delete(&tasks, "al___000002", "al___000001")
        .await;

    let store = h.store.clone();
    wait_until(move || {
        let store = store.clone();
        async move {
            store.get("al___000002", "job___y").await.is_some()
                && store.get("al___000001", "job___y").await.is_none()
        }
    })
    .await;

    let fetched = h
        .resolver
        .fetch_by_ids(&["job___y".to_string()], None)
        .await
        .unwrap();
    assert_eq!(fetched["job___y"].status, TaskStatus::Unterminated);
}

#[tokio::test]
async fn merger_job_entry_sweeps_partials_left_in_the_old_index() {
    let config = EngineConfig {
        max_index_docs: 1,
        ..EngineConfig::default()
    };
    let h = harness(config);
    let alias = h.manager.ensure_alias("sweep").await.unwrap();
    let first_index = h.manager.current_index(&alias).await.unwrap();

    let tasks: BTreeMap<String, Task> = [unterminated_task("job___left")].into();
    h.engine.index(&tasks, &first_index).await;

    // Periodic invocation outside the write path: the idle alias still
    // rolls over and its partial task is swept forward.
    h.manager.migrate_partials("flow-sweeper").await;

    let store = h.store.clone();
    let manager = h.manager.clone();
    let alias_name = alias.clone();
    wait_until(move || {
        let store = store.clone();
        let manager = manager.clone();
        let alias = alias_name.clone();
        async move {
            let Some(current) = manager.current_index(&alias).await else {
                return false;
            };
            current != "taskmill-sweep___000001"
                && store.get(&current, "job___left").await.is_some()
                && store.get("taskmill-sweep___000001", "job___left").await.is_none()
        }
    })
    .await;
}

#[tokio::test]
async fn event_stream_merges_into_one_queryable_task() {
    let h = harness(EngineConfig::default());
    h.store.create_index("idx___000001", "idx").await.unwrap();

    let start = Event::start(Some("job___abc".into()), "job");
    let info = Event::info(Some("job___abc".into()), "job");
    let success = Event::success(Some("job___abc".into()), "job");

    let mut task = Task::from_event(&start, 30);
    task.apply_event(&info);
    task.apply_event(&success);

    let tasks: BTreeMap<String, Task> = [("job___abc".to_string(), task)].into();
    h.engine.index(&tasks, "idx___000001").await;

    let fetched = h
        .resolver
        .fetch_by_ids(&["job___abc".to_string()], Some("idx___000001"))
        .await
        .unwrap();
    let merged = &fetched["job___abc"];
    assert_eq!(merged.status, TaskStatus::Success);
    assert!(merged.start_time.is_some());
    assert!(merged.end_time.is_some());
    assert!(merged.meta.date_to_delete.is_some());
}

#[tokio::test]
async fn bootstrap_installs_template_and_script() {
    let store = MemoryStore::new();
    taskmill_server::store::bootstrap(&store, 3, 1).await.unwrap();
    assert!(store.template("taskmill-template").await.is_some());
    assert!(store.script("taskmill-merge").await.is_some());
}

#[tokio::test]
async fn dedup_survives_raw_documents_written_outside_the_engine() {
    let h = harness(EngineConfig::default());
    h.store.create_index("a___000001", "a").await.unwrap();
    h.store.create_index("a___000002", "a").await.unwrap();
    for index in ["a___000001", "a___000002"] {
        h.store
            .bulk(&[WriteRequest::new(
                index,
                "dup___1",
                serde_json::json!({"status": "PARTIAL_SUCCESS"}),
            )])
            .await
            .unwrap();
    }

    let fetched = h
        .resolver
        .fetch_by_ids(&["dup___1".to_string()], None)
        .await
        .unwrap();
    assert!(fetched.is_empty());

    // Scoped to a single index there is no conflict.
    let scoped = h
        .resolver
        .fetch_by_ids(&["dup___1".to_string()], Some("a___000001"))
        .await
        .unwrap();
    assert_eq!(scoped["dup___1"].status, TaskStatus::PartialSuccess);
}
