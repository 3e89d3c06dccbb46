/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * relaydb - MongoDB-wire-compatible server over a JSONB document store
 * and a read-only OLAP backend
 *
 * @file main.rs
 * @brief relaydb server entry point
 */

use std::sync::Arc;
use std::time::SystemTime;

use relaydb::backend::Backend;
use relaydb::config::RelayConfig;
use relaydb::cursor::CursorManager;
use relaydb::document_backend::DocumentBackend;
use relaydb::function_evaluator::FunctionEvaluator;
use relaydb::health::{self, HealthChecker};
use relaydb::logger::{init_tracing_logger, LogLevel};
use relaydb::olap_backend::OlapBackend;
use relaydb::shutdown::{ShutdownConfig, ShutdownManager, ShutdownReason};
use relaydb::{Dispatcher, RelayServer};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let start_time = SystemTime::now();

    let config = match RelayConfig::load_from_env() {
        Ok(config) => config,
        Err(_) => RelayConfig::load("config/relaydb.toml").await?,
    };

    let log_level = match config.logging.level.as_str() {
        "debug" => LogLevel::Debug,
        "warn" | "warning" => LogLevel::Warning,
        "error" => LogLevel::Error,
        _ => LogLevel::Info,
    };
    init_tracing_logger(log_level).map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    info!("relaydb starting, listening on {}:{}", config.server.host, config.server.port);

    let metrics_handle = health::install_recorder().map_err(|e| anyhow::anyhow!(e))?;

    let cursors = CursorManager::new(config.cursor.ttl);
    let evaluator = Arc::new(FunctionEvaluator::new(
        config.function_evaluator.enabled,
        config.function_evaluator.cache_capacity,
    ));

    let document_backend = DocumentBackend::new(&config.document_backend, cursors.clone(), evaluator).await?;
    let pool = document_backend.pool();
    let document_backend: Arc<dyn Backend> = Arc::new(document_backend);

    let olap_backend: Option<Arc<dyn Backend>> = if config.olap_backend.enabled {
        info!("OLAP backend enabled: {}:{}", config.olap_backend.host, config.olap_backend.port);
        Some(Arc::new(OlapBackend::new(config.olap_backend.clone(), cursors.clone())?))
    } else {
        None
    };

    let dispatcher = Arc::new(Dispatcher::new(document_backend, olap_backend, config.clone(), cursors.clone()));

    let shutdown_manager = Arc::new(ShutdownManager::new(ShutdownConfig::default()));
    shutdown_manager.start_signal_handling().await.map_err(|e| anyhow::anyhow!(e))?;

    let checker = Arc::new(HealthChecker::new(pool, env!("CARGO_PKG_VERSION").to_string()));
    let health_port = config.monitoring.health_check_port;
    tokio::spawn(health::serve(checker, metrics_handle, health_port));
    info!("health/metrics endpoints listening on 0.0.0.0:{health_port}");

    tokio::spawn(cursor_reaper(cursors));

    let server = RelayServer::new(config.server.host.clone(), config.server.port, dispatcher);
    let shutdown_rx = shutdown_manager.subscribe();
    if let Err(e) = server.run(shutdown_rx).await {
        error!(error = %e, "connection server exited with an error");
    }

    let _ = shutdown_manager.shutdown_reason().await.unwrap_or(ShutdownReason::Request);
    info!("relaydb stopped after {}s uptime", relaydb::logger::process_uptime_secs(start_time));
    Ok(())
}

/// Periodically sweeps TTL-expired cursors (spec §4.10) so a client that
/// opens a cursor and never returns doesn't pin its result set forever.
async fn cursor_reaper(cursors: CursorManager) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
    loop {
        interval.tick().await;
        let reaped = cursors.cleanup_expired();
        if reaped > 0 {
            info!(reaped, "expired cursors removed");
        }
    }
}
