//! Warbler - a small social network backend
//!
//! - Accounts with hashed passwords and bearer tokens
//! - Follow / unfollow and a timeline of followed users' posts
//! - Posts are accepted immediately and written to SQLite in batches

mod auth;
mod config;
mod db;
mod web;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let config = config::Config::load()?;
    init_logging(&config.logging.level);

    info!("Starting Warbler...");

    let db = db::Database::new(&config.database).await?;
    db.run_migrations().await?;
    info!("Database initialized");

    let tokens = auth::TokenService::new(
        config.auth.jwt_secret.as_bytes(),
        Duration::from_secs(config.auth.token_expiry_secs),
    )?;
    let hasher = auth::PasswordHasher::new(config.auth.hash_iterations);

    // Batches accepted posts into bulk inserts
    let write_buffer = db::WriteBuffer::start(Arc::new(db.clone()), (&config.ingest).into());

    let state = Arc::new(web::AppState::new(db, tokens, hasher, write_buffer.sender()));

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let served = web::start_server(&config, state, shutdown).await;
    if let Err(e) = &served {
        error!("Web server failed: {:#}", e);
    }

    // HTTP is down, no new posts can arrive; commit what the worker holds
    let stats = write_buffer.shutdown().await;
    info!(
        "Shutdown complete (accepted={}, committed={}, failed={}, abandoned={})",
        stats.accepted, stats.committed, stats.failed, stats.abandoned
    );

    served
}

/// Initialize logging based on LOG_FORMAT env var.
/// Use LOG_FORMAT=gcp for structured GCP Cloud Logging. RUST_LOG overrides the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }

    shutdown.cancel();
}
