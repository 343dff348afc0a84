//! mps-daemon entry point.
//!
//! Thin: loads config and secrets, wires the engine, starts the background
//! workers and serves HTTP. Handlers live in `routes.rs`, shared state in
//! `state.rs`, engine construction in `wiring.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use mps_config::{load_layered_yaml, report_unused_keys, resolve_secrets, UnusedKeyPolicy};
use mps_daemon::{routes, state, wiring};
use tokio::sync::watch;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

const ENV_CONFIG_PATHS: &str = "MPS_CONFIG_PATHS";
const ENV_DAEMON_ADDR: &str = "MPS_DAEMON_ADDR";
const DEFAULT_CONFIG_PATH: &str = "config/base.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Dev convenience; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let paths = config_paths_from_env();
    let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    let loaded = load_layered_yaml(&path_refs)?;
    report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Warn)?;
    let cfg = loaded.app_config()?;
    let secrets = resolve_secrets(&cfg);
    info!(config_hash = %loaded.config_hash, paths = ?paths, "config loaded");

    let engine = wiring::Engine::connect(&cfg, &secrets).await?;
    let ctx = engine.ctx.clone();

    let follow_up = Arc::new(wiring::follow_up_queue(&ctx, &cfg));
    let ingestor = wiring::webhook_ingestor(&ctx, &cfg, &secrets, Some(Arc::clone(&follow_up)));
    let shared = Arc::new(state::AppState::new(
        ctx.clone(),
        ingestor,
        wiring::tenant_ids(&cfg),
    ));

    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = wiring::outbox_dispatcher(&ctx, &cfg)?
        .spawn(Duration::from_millis(cfg.outbox.interval_ms.max(10)), shutdown_rx);

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env()
        .or_else(|| cfg.server.bind.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    info!("mps-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    info!("shutting down background workers");
    let _ = shutdown_tx.send(true);
    let _ = dispatcher.await;

    // In-flight sync tasks may still hold AppState; the queue drains anyway.
    follow_up.shutdown().await;
    drop(shared);
    drop(ctx);
    engine.close(Duration::from_secs(5)).await;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Comma-separated layer list, base first.
fn config_paths_from_env() -> Vec<String> {
    std::env::var(ENV_CONFIG_PATHS)
        .ok()
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![DEFAULT_CONFIG_PATH.to_string()])
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var(ENV_DAEMON_ADDR).ok()?.parse().ok()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "ctrl_c handler failed");
    }
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
