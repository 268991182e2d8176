//! Disbursement engine — entry point.
//!
//! Serves the webhook, checkout and admin API over SQLite, and optionally
//! runs a periodic reconciliation sweep in the background.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use disbursement_engine::api::AppState;
use disbursement_engine::config::Config;
use disbursement_engine::gateway::HttpGateway;
use disbursement_engine::{build_router, db, reconcile};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    if config.webhook_secret.is_none() {
        if config.webhook_require_signature {
            warn!("WEBHOOK_SECRET is not set and WEBHOOK_REQUIRE_SIGNATURE=true; every webhook will be rejected");
        } else {
            warn!("WEBHOOK_SECRET is not set; webhooks are accepted WITHOUT signature verification");
        }
    }
    if config.admin_api_token.is_none() {
        warn!("ADMIN_API_TOKEN is not set; admin routes are disabled");
    }

    let pool = db::init_pool(&config.database_url).await?;

    let gateway = HttpGateway::new(
        &config.payment_api_url,
        &config.payment_secret_key,
        Duration::from_secs(config.http_timeout_secs),
    )?;

    // ─── Reconciliation sweep ─────────────────────────────
    let shutdown = CancellationToken::new();
    let sweep = (config.reconcile_interval_secs > 0).then(|| {
        tokio::spawn(reconcile::run(
            pool.clone(),
            Duration::from_secs(config.reconcile_interval_secs),
            shutdown.clone(),
        ))
    });

    // ─── REST API ─────────────────────────────────────────
    let addr = format!("0.0.0.0:{}", config.api_port);
    let state = Arc::new(AppState::new(pool, config, Arc::new(gateway)));

    let app = build_router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Some(sweep) = sweep {
        let _ = sweep.await;
    }
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        _ = token.cancelled() => {}
    }
    token.cancel();
}
