//! # Signage Schedule Server
//!
//! Runs the schedule resolution and live delivery engine behind an HTTP API
//! and a monitor WebSocket endpoint.
//!
//! ## Core Responsibilities:
//! - **Bootstrap:** configuration, logging and the schedule store (PostgreSQL
//!   when a database URL is configured, otherwise the in-memory store).
//! - **Background tasks:** daily cache refresh and the reconciliation dispatch loop.
//! - **Serving:** `/api/v1/*`, `/health` and `/ws` on one listener.
//! - **Shutdown:** Ctrl-C or SIGTERM cancels every task and waits for them.

use anyhow::{Context, Result};
use lib_signage::core::{ActiveSource, Clock, ZonedClock};
use lib_signage::store::{AssignmentStore, DeviceDirectory, InMemoryStore, PgStore};
use lib_signage::{ConnectionRegistry, DailyRefresh, ReconciliationDispatcher, ScheduleCache, ScheduleEngine};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod signage_logic;
use signage_logic::{config, downstream, logger, seed, state};

async fn shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        warn!("Could not install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();

    let settings = config::load_config()?;
    let _log_guard = logger::setup_logging(&settings.log_dir, &settings.log_level)?;
    info!(
        port = settings.port,
        timezone = %settings.timezone,
        source = ?settings.dispatch_source,
        "Configuration loaded"
    );

    // --- Phase 1: Schedule store ---
    let (assignments, directory): (Arc<dyn AssignmentStore>, Arc<dyn DeviceDirectory>) =
        match &settings.database_url {
            Some(url) => {
                let store = Arc::new(
                    PgStore::connect(url, settings.db_max_connections)
                        .await
                        .context("failed to open the PostgreSQL schedule store")?,
                );
                let assignments: Arc<dyn AssignmentStore> = store.clone();
                let directory: Arc<dyn DeviceDirectory> = store;
                (assignments, directory)
            }
            None => {
                warn!("No database URL configured, schedules are kept in memory only");
                let store = match &settings.seed_path {
                    Some(path) => seed::Seed::from_file(path)?.into_store(),
                    None => InMemoryStore::new(),
                };
                let store = Arc::new(store);
                let assignments: Arc<dyn AssignmentStore> = store.clone();
                let directory: Arc<dyn DeviceDirectory> = store;
                (assignments, directory)
            }
        };

    // --- Phase 2: Engine components ---
    let clock: Arc<dyn Clock> = Arc::new(ZonedClock::new(settings.timezone));
    let cache = ScheduleCache::new();
    let registry = Arc::new(ConnectionRegistry::new(directory, cache.clone()));
    let engine = Arc::new(ScheduleEngine::new(
        assignments.clone(),
        cache.clone(),
        registry.clone(),
        clock.clone(),
        settings.horizon_days,
    ));
    let refresh = Arc::new(
        DailyRefresh::new(assignments.clone(), cache.clone(), registry.clone(), clock.clone())
            .with_epsilon(settings.refresh_epsilon)
            .with_horizon(settings.horizon_days),
    );
    let mut dispatcher = ReconciliationDispatcher::new(cache, registry.clone(), settings.rotation_period);
    if settings.dispatch_source == ActiveSource::Store {
        dispatcher = dispatcher.with_store_source(assignments);
    }
    let dispatcher = Arc::new(dispatcher);

    // --- Phase 3: Background tasks ---
    let cancel = CancellationToken::new();
    let refresh_handle = tokio::spawn(refresh.run(cancel.child_token()));
    let dispatch_handle = tokio::spawn(dispatcher.run(settings.dispatch_interval, clock, cancel.child_token()));

    // --- Phase 4: HTTP and monitor sockets ---
    let app_state = state::AppState::new(engine, registry, state::Liveness::from(&settings));
    let mut server_handle = tokio::spawn(downstream::run(settings.clone(), app_state, cancel.child_token()));

    let server_result = tokio::select! {
        _ = shutdown_signal() => {
            cancel.cancel();
            server_handle.await
        }
        result = &mut server_handle => {
            cancel.cancel();
            result
        }
    };

    // --- Phase 5: Drain ---
    let (refresh_result, dispatch_result) = tokio::join!(refresh_handle, dispatch_handle);
    for (name, result) in [("daily refresh", refresh_result), ("dispatch loop", dispatch_result)] {
        if let Err(e) = result {
            error!("{} task failed: {}", name, e);
        }
    }

    match server_result {
        Ok(Ok(())) => {
            info!("Shutdown complete.");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Server stopped with an error: {:#}", e);
            Err(e)
        }
        Err(e) => Err(e).context("server task panicked"),
    }
}
