//! Service entry point: configuration, logging, database, HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use branch_attendance::config::Config;
use branch_attendance::db;
use branch_attendance::routes::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    // Structured logging: console + daily rolling file.
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,branch_attendance=debug"));

    std::fs::create_dir_all(&config.log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "attendance");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Keep the guard alive for the lifetime of the process; dropping it
    // flushes file logs.
    std::mem::forget(guard);

    info!(
        "Starting branch attendance service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let db = db::init(&config.data_dir)?;

    let port = config.port;
    let state = Arc::new(AppState { db, config });
    let app = routes::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("Attendance endpoint listening on {addr}");

    axum::serve(listener, app).await.context("serve")?;
    Ok(())
}
