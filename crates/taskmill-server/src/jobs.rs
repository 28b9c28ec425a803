//! Periodic jobs.
//!
//! Thin async entry points invoked by an external scheduler. Mutual
//! exclusion for concurrent runs lives in the lifecycle manager, not here.

use std::time::Duration;

use rand::Rng;
use uuid::Uuid;

use crate::lifecycle::IndexLifecycleManager;
use crate::resolve::TaskResolver;

/// Sweeps partial tasks left in retiring indices forward into the current
/// index, re-checking rollover for idle aliases on the way.
///
/// Starts with a small random jitter so that multiple scheduler nodes firing
/// at the same instant spread their load.
pub async fn run_partials_merger(manager: &IndexLifecycleManager) {
    let flow_id = format!("partials-merger-{}", Uuid::new_v4());
    tracing::info!("[{flow_id}] Partial tasks merger job started");

    let jitter = rand::thread_rng().gen_range(0..10);
    tokio::time::sleep(Duration::from_secs(jitter)).await;

    manager.migrate_partials(&flow_id).await;
    tracing::info!("[{flow_id}] Partial tasks merger job ended");
}

/// Deletes every task document whose TTL has passed, across all indices.
pub async fn run_expired_sweeper(resolver: &TaskResolver) {
    let flow_id = format!("expired-sweeper-{}", Uuid::new_v4());
    tracing::info!("[{flow_id}] Expired tasks sweeper job started");
    resolver.delete_expired();
    tracing::info!("[{flow_id}] Expired tasks sweeper job ended");
}
