// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fnflow Core - Cloud-Functions Completion Engine
//!
//! The service binary: wires configuration, the journal store, the
//! executor, and the supervisor, then waits for shutdown. The HTTP API
//! that translates client requests into graph commands mounts on
//! [`fnflow_core::GraphManager`] and lives outside this crate.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{error, info};

use fnflow_core::FlowRuntime;
use fnflow_core::config::Config;
use fnflow_core::executor::ExecutorConfig;
use fnflow_core::migrations;
use fnflow_core::persistence::{PersistenceProvider, PostgresPersistence, SqlitePersistence};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fnflow_core=info".parse().unwrap()),
        )
        .init();

    info!("Starting Fnflow Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        runtime = %config.runtime_base_url(),
        snapshot_interval = config.snapshot_interval,
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let provider: Arc<dyn PersistenceProvider> = if config.database_url.starts_with("sqlite") {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&config.database_url)
            .await?;
        info!("Running database migrations...");
        migrations::run_sqlite(&pool).await?;
        Arc::new(SqlitePersistence::new(pool, config.snapshot_interval))
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;

        // Verify connection
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await?;
        info!(result = row.0, "Database health check passed");

        info!("Running database migrations...");
        migrations::run_postgres(&pool).await?;
        Arc::new(PostgresPersistence::new(pool, config.snapshot_interval))
    };
    info!("Database ready");

    let runtime = FlowRuntime::builder()
        .persistence(provider)
        .executor(ExecutorConfig::from_config(&config))
        .idle_window(config.idle_window)
        .build()?
        .start()
        .await?;

    info!("Fnflow Core initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
