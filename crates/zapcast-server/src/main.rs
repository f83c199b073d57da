//! Zapcast - Campaign delivery scheduler entry point

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zapcast_api::AppState;
use zapcast_common::config::{Config, LoggingConfig};
use zapcast_core::{
    CampaignManager, CampaignRunner, Clock, DispatchEngine, DispatchInvoker, DispatchMetrics,
    HttpTransport, SchedulerTrigger, StallDetector, Stores, SweepWorker, SystemClock,
};
use zapcast_storage::db::DatabasePool;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting Zapcast campaign scheduler...");

    // Initialize database
    let db_pool = DatabasePool::new(&config.database).await?;

    // Run migrations
    db_pool.migrate().await?;

    let stores = Stores::postgres(db_pool.clone());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Arc::new(DispatchMetrics::new().context("Failed to register metrics")?);
    let transport = Arc::new(HttpTransport::new(&config.transport)?);

    // Dispatch engine and in-process runner
    let engine = Arc::new(DispatchEngine::new(
        stores.clone(),
        transport,
        clock.clone(),
        metrics.clone(),
        &config.dispatch,
    ));
    let runner = CampaignRunner::new(
        engine,
        clock.clone(),
        Duration::from_secs(config.dispatch.reinvoke_delay_secs),
    );
    let invoker: Arc<dyn DispatchInvoker> = Arc::new(runner);

    // Sweeps
    let trigger = Arc::new(SchedulerTrigger::new(
        stores.clone(),
        invoker.clone(),
        clock.clone(),
        metrics.clone(),
    ));
    let stall = Arc::new(StallDetector::new(
        stores.clone(),
        invoker.clone(),
        clock.clone(),
        metrics.clone(),
        &config.scheduler,
    ));

    // Start sweep worker
    let worker_handle = {
        let worker = SweepWorker::new(trigger.clone(), stall.clone(), &config.scheduler);
        tokio::spawn(async move {
            worker.run().await;
        })
    };

    // Start API server
    let api_handle = {
        let state = AppState {
            manager: Arc::new(CampaignManager::new(stores, clock, metrics.clone())),
            invoker,
            trigger,
            stall,
            metrics,
            trigger_token: config.api.trigger_token.clone(),
            db_pool: Some(db_pool),
        };
        let app = zapcast_api::create_router(state);
        let addr = format!("{}:{}", config.server.bind_address, config.api.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind API server on {}", addr))?;
        info!("Starting API server on {}", addr);

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("API server error: {}", e);
            }
        })
    };

    if config.api.trigger_token.is_none() {
        tracing::warn!("No API trigger token configured, API is unauthenticated");
    }

    info!("Zapcast started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    worker_handle.abort();
    api_handle.abort();

    info!("Zapcast shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_level(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
