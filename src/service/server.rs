use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::api::{self, AppState, SharedState};
use crate::backends::Backends;
use crate::config::ServiceConfig;

/// Build the application router.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let mut app = api::router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Start the compile server and run until a shutdown signal arrives.
///
/// After the signal, admission is closed and open connections get
/// `timeouts.shutdown_secs` to finish before the server stops waiting.
pub async fn start_server(config: ServiceConfig) -> Result<()> {
    config.validate()?;
    let backends = Backends::from_config(&config)?;
    let state = Arc::new(AppState::new(&config, backends)?);
    let admission = state.admission.clone();
    let app = build_router(state, config.server.dev_mode);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        backend = %config.storage.backend,
        "compile server listening"
    );

    let (stopping_tx, mut stopping_rx) = watch::channel(false);
    let shutdown = async move {
        shutdown_signal().await;
        admission.close();
        let _ = stopping_tx.send(true);
    };

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .into_future();

    let grace = config.shutdown_timeout();
    tokio::select! {
        result = server => result.context("Server error")?,
        _ = async {
            let _ = stopping_rx.wait_for(|stopping| *stopping).await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(grace_secs = grace.as_secs(), "connections still open after grace period");
        }
    }

    info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
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
                warn!(error = %e, "failed to install SIGTERM handler");
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
    info!("shutting down");
}
