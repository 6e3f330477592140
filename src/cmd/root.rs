//! Main daemon command: wires configuration, registry, container driver,
//! lifecycle manager and background reconcile loops into an HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sandbox_daemon::config::Settings;
use sandbox_daemon::docker::{ContainerDriver, ContainerRuntime};
use sandbox_daemon::lifecycle::LifecycleManager;
use sandbox_daemon::reconcile::{spawn_expirer, spawn_reconciler};
use sandbox_daemon::registry::create_store;
use sandbox_daemon::router::{self, AppState};

pub async fn run() -> Result<()> {
    let settings = Arc::new(Settings::load()?);
    info!("configuration loaded");
    info!("  bind: {}:{}", settings.host, settings.port);
    info!("  sandbox image: {}", settings.sandbox_image);
    info!("  store backend: {}", settings.sandbox_store);

    let store = create_store(&settings).await?;

    let driver: Arc<dyn ContainerRuntime> = Arc::new(ContainerDriver::connect()?);
    info!("connected to container runtime");

    let manager = Arc::new(LifecycleManager::new(store.clone(), driver.clone(), settings.clone()));

    let shutdown_token = CancellationToken::new();

    let reconciler_handle = spawn_reconciler(store.clone(), driver.clone(), shutdown_token.clone());
    let expirer_handle = spawn_expirer(store.clone(), manager.clone(), shutdown_token.clone());
    info!("reconciler and expirer background loops started");

    let state = AppState {
        manager: manager.clone(),
        driver: driver.clone(),
        settings: settings.clone(),
        started_at: Instant::now(),
    };
    let app = router::build_router(state);

    let bind_addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .expect("invalid bind address");

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    let shutdown_token_for_signal = shutdown_token.clone();
    let store_for_shutdown = store.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        warn!("received shutdown signal, stopping");

        shutdown_token_for_signal.cancel();
        driver.close().await;
        if let Err(e) = store_for_shutdown.close().await {
            error!(error = %e, "error closing registry backend");
        }

        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    info!("listening on {bind_addr}");
    axum_server::bind(bind_addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    reconciler_handle.abort();
    expirer_handle.abort();

    info!("daemon stopped");
    Ok(())
}
