use anyhow::Context;
use castflow_worker::{Coordinator, CoordinatorConfig, LogFormat, Stores};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

const DEFAULT_LOG_FILTER: &str =
    "castflow_worker=info,castflow_serviceregistry=info,castflow_workflow=info";

const DB_MAX_CONNECTIONS: u32 = 20;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = CoordinatorConfig::from_env().context("Invalid configuration")?;

    // --- Tracing ---
    let fmt_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(fmt_layer)
        .init();
    tracing::info!(host = %config.host_url, "Loaded coordinator configuration");

    // --- Persistence ---
    let stores = match &config.database_url {
        Some(database_url) => {
            let pool = castflow_db::create_pool(database_url, DB_MAX_CONNECTIONS)
                .await
                .context("Failed to connect to database")?;
            castflow_db::health_check(&pool)
                .await
                .context("Database health check failed")?;
            castflow_db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            Stores::postgres(castflow_db::PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, jobs and workflows are kept in memory");
            Stores::memory()
        }
    };

    // --- Coordinator ---
    let coordinator = Coordinator::start(config, stores)
        .await
        .context("Failed to start coordinator")?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");

    coordinator.stop().await;
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
