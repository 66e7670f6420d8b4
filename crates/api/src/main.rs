//! DRN realtime server

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use drn_api::{auth::JwtVerifier, routes::create_router, AppState, Config, RealtimeService};
use drn_shared::RedisStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; the environment may be set directly
    let _ = dotenvy::dotenv();

    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!(
        bind_address = %config.bind_address,
        service = %config.service_name,
        allowed_hosts = config.allowed_hosts.len(),
        "Starting DRN realtime server"
    );

    // The instance cannot serve without the shared store
    let store = RedisStore::connect(&config.redis_url)
        .await
        .context("Failed to connect to Redis")?;

    let verifier = JwtVerifier::new(&config.auth_key, &config.auth_issuer, &config.auth_audience)
        .context("Failed to build token verifier")?;

    let realtime = RealtimeService::new(Arc::new(store), config.realtime());
    realtime
        .start()
        .await
        .context("Failed to start realtime service")?;

    let state = AppState::new(realtime.clone(), Arc::new(verifier), config.allowed_hosts.clone());
    let app = create_router(state);

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;

    tracing::info!(address = %config.bind_address, "Listening");

    let shutdown_realtime = realtime.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
            // Sockets are detached from the server, so close them here
            shutdown_realtime.shutdown().await;
        })
        .await
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

/// JSON logs by default; `LOG_FORMAT=pretty` for local development
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("drn_api=info,drn_shared=info,tower_http=info"));

    let pretty = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "pretty");

    if pretty {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
