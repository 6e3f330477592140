//! Background convergence: the Reconciler closes the gap between the
//! registry and what's actually running on the host; the Expirer closes
//! non-terminal records whose TTL has passed. Both are periodic,
//! idempotent, and safe to run concurrently with request handling.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::docker::ContainerRuntime;
use crate::lifecycle::LifecycleManager;
use crate::registry::SandboxStore;

/// Every container the daemon creates carries this label pair; the
/// reconciler filters the host's container list by it to find every
/// sandbox container regardless of which `sandbox_id` it belongs to.
pub const MANAGED_BY_LABEL_KEY: &str = "managed_by";
pub const MANAGED_BY_LABEL_VALUE: &str = "sandboxd";

const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_EXPIRE_INTERVAL: Duration = Duration::from_secs(60);

/// Spawns the reconciler loop; returns its `JoinHandle`. Stops promptly
/// when `cancel` is triggered.
pub fn spawn_reconciler(
    store: Arc<dyn SandboxStore>,
    driver: Arc<dyn ContainerRuntime>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(DEFAULT_RECONCILE_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("reconciler stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = run_reconcile(&store, &driver).await {
                        warn!(error = %e, "reconcile pass failed");
                    }
                }
            }
        }
    })
}

/// Spawns the expirer loop; returns its `JoinHandle`.
pub fn spawn_expirer(
    store: Arc<dyn SandboxStore>,
    manager: Arc<LifecycleManager>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(DEFAULT_EXPIRE_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("expirer stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = run_expire(&store, &manager).await {
                        warn!(error = %e, "expire pass failed");
                    }
                }
            }
        }
    })
}

async fn run_reconcile(store: &Arc<dyn SandboxStore>, driver: &Arc<dyn ContainerRuntime>) -> crate::error::Result<()> {
    let live_ids = driver
        .list_ids_with_label(MANAGED_BY_LABEL_KEY, MANAGED_BY_LABEL_VALUE)
        .await
        .unwrap_or_default();

    let reconciled = store.reconcile(&live_ids).await?;
    if !reconciled.is_empty() {
        info!(count = reconciled.len(), "reconciler stopped orphaned registry records");
    }
    Ok(())
}

async fn run_expire(store: &Arc<dyn SandboxStore>, manager: &Arc<LifecycleManager>) -> crate::error::Result<()> {
    let expired = store.expire_stale().await?;
    for sandbox_id in &expired {
        if let Err(e) = manager.reap_expired(sandbox_id).await {
            warn!(sandbox_id = %sandbox_id, error = %e, "expirer-triggered container teardown failed");
        }
    }
    if !expired.is_empty() {
        info!(count = expired.len(), "expirer destroyed stale sandboxes");
    }
    Ok(())
}
