use anyhow::Result;
use std::net::SocketAddr;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

mod chunker;
mod config;
mod dense;
mod embedder;
mod error;
mod filters;
mod indexer;
mod lexical;
mod pipeline;
mod profiles;
mod ratelimit;
mod registry;
mod routes;
mod server;
mod state;
mod vault;

#[tokio::main]
async fn main() -> Result<()> {
    let log_dir = std::env::var("TEMOA_LOG_DIR").unwrap_or_else(|_| {
        dirs::data_local_dir()
            .map(|d| d.join("temoa").join("logs").to_string_lossy().to_string())
            .unwrap_or_else(|| ".temoa-logs".to_string())
    });
    std::fs::create_dir_all(&log_dir).ok();

    // Daily-rotated file log next to a compact stdout layer.
    let file_appender = tracing_appender::rolling::daily(&log_dir, "temoa.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "temoa=info,tower_http=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Log panics before aborting.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "temoa::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));

    let config = config::AppConfig::from_env();
    if config.vaults.is_empty() {
        anyhow::bail!("no vaults configured; set TEMOA_VAULT or TEMOA_VAULTS");
    }
    let addr: SocketAddr = config.listen_addr.parse()?;

    info!(
        listen_addr = %config.listen_addr,
        model = %config.model_id,
        vaults = config.vaults.len(),
        cache_capacity = config.cache_capacity,
        change_detection = ?config.change_detection,
        log_dir = %log_dir,
        "temoa starting"
    );

    let app_state = state::AppState::new(config);
    let app = server::create_app(app_state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("temoa listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("temoa shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received terminate signal, shutting down"); },
    }
}
