use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use emcache::client::OfficialApi;
use emcache::config::Config;
use emcache::dispatch::Dispatcher;
use emcache::model::{Nation, Player, Record, Town};
use emcache::store::{Database, Registry};
use emcache::{api, metrics, sync};

async fn version() -> Json<Value> {
    Json(json!({ "service": "emcache", "version": env!("CARGO_PKG_VERSION") }))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::load();
    metrics::register_metrics();

    let dispatcher =
        Dispatcher::with_rate(config.rate_per_minute).expect("Invalid request rate");
    let api_client = Arc::new(
        OfficialApi::new(&config.api_base, config.request_timeout)
            .expect("Failed to build API client"),
    );

    // One database per map, with a store per mirrored record type
    let registry = Arc::new(Registry::new());
    for map in &config.maps {
        let db = registry.register(Database::new(map, config.map_dir(map)));
        db.define(&Town::STORE).expect("Failed to load towns store");
        db.define(&Nation::STORE).expect("Failed to load nations store");
        db.define(&Player::STORE).expect("Failed to load players store");
    }

    let sync_worker = config.sync_interval.map(|period| {
        sync::spawn_sync_worker(
            api_client.clone(),
            dispatcher.clone(),
            registry.clone(),
            period,
        )
    });
    let flush_worker = sync::spawn_flush_worker(registry.clone(), config.flush_interval);

    let app = Router::new()
        .route("/version", get(version))
        .merge(api::router(registry.clone(), dispatcher.clone()))
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {addr}: {e}"));

    tracing::info!(
        maps = ?config.maps,
        rate_per_minute = config.rate_per_minute,
        "emcache listening on port {}",
        config.port
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to start server");

    // Stop background work, then persist everything one last time
    if let Some(worker) = sync_worker {
        worker.abort();
    }
    flush_worker.abort();
    dispatcher.bucket().close();

    if sync::flush_registry(registry).await {
        tracing::info!("Final flush complete");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
    tracing::info!("Shutting down");
}
