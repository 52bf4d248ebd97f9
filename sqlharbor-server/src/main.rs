use std::sync::Arc;

use anyhow::{Context, Result};
use sqlharbor_core::config::ServerConfig;
use sqlharbor_core::manager::ConnectionManager;
use sqlharbor_core::reaper::Reapers;
use sqlharbor_core::session::TxSessionRegistry;
use sqlharbor_core::statement::StatementRunner;
use sqlharbor_core::tx::TxEngine;
use sqlharbor_core::{CallContext, Caller};
use tokio_util::sync::CancellationToken;

use tracing::{info, warn};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

mod http;
mod status;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = ServerConfig::load().context("failed to load configuration")?;
    init_tracing(&config);
    info!("service config:\n{:?}", config);
    let addr = config
        .bind_addr()
        .context("failed to resolve bind address")?;

    let manager = Arc::new(ConnectionManager::from_config(&config));
    let restored = manager
        .restore(&CallContext::new(Caller::read_write("system")), &config.databases)
        .await
        .context("failed to restore mounted databases")?;

    let engine = Arc::new(TxEngine::new(manager.clone(), config.stream_batch_rows));
    let sessions = Arc::new(TxSessionRegistry::from_config(engine.clone(), &config));
    let runner = Arc::new(StatementRunner::new(manager.clone(), config.stream_batch_rows));
    let reapers = Reapers::spawn_from_config(&config, manager.clone(), sessions.clone());

    let shutdown = CancellationToken::new();
    let app = http::router(http::AppState {
        manager: manager.clone(),
        engine,
        sessions: sessions.clone(),
        runner,
        stream_idle_timeout: config.stream_idle_timeout(),
        shutdown: shutdown.clone(),
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, restored, "starting sqlharbor server");

    tokio::spawn(wait_for_signal(shutdown.clone()));
    let graceful = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await
        .context("http server terminated unexpectedly")?;

    reapers.shutdown().await;
    let rolled_back = sessions.close_all().await;
    manager.close_all();
    info!(rolled_back, "server shutdown complete");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("received SIGTERM, initiating graceful shutdown");
        }
    }
    shutdown.cancel();
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlharbor_core::tx=debug"));

    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
            .init();
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
            .init();
    }
}
