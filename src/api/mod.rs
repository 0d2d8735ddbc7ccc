// HTTP API routes: health, metrics, and read access to the cached stores.

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde_json::json;

use crate::dispatch::Dispatcher;
use crate::error::RegistryError;
use crate::metrics;
use crate::store::Registry;

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub dispatcher: Dispatcher,
}

// ── Error helper ──────────────────────────────────────────────────────

fn json_error(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(json!({ "error": msg })))
}

fn registry_error(e: RegistryError) -> impl IntoResponse {
    let status = match &e {
        RegistryError::DatabaseNotFound(_) | RegistryError::StoreNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        RegistryError::TypeMismatch { .. }
        | RegistryError::Store(_)
        | RegistryError::Task(_) => {
            tracing::error!("Registry error: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    json_error(status, &e.to_string())
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(registry: Arc<Registry>, dispatcher: Dispatcher) -> Router {
    let state = AppState {
        registry,
        dispatcher,
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_text))
        .route("/api/{db}/stats", get(database_stats))
        .route("/api/{db}/flush", post(flush_database))
        .route("/api/{db}/{store}/{key}", get(get_entry))
        .with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "emcache",
        "tokens_available": state.dispatcher.bucket().available(),
    }))
}

async fn metrics_text() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

async fn database_stats(
    State(state): State<AppState>,
    Path(db): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&db) {
        Ok(database) => (
            StatusCode::OK,
            Json(json!({ "database": database.name(), "stores": database.stats() })),
        )
            .into_response(),
        Err(e) => registry_error(e).into_response(),
    }
}

async fn get_entry(
    State(state): State<AppState>,
    Path((db, store, key)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let lookup = state
        .registry
        .get(&db)
        .and_then(|database| database.lookup_json(&store, &key));
    match lookup {
        Ok(Some(value)) => (StatusCode::OK, Json(value)).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Entry not found").into_response(),
        Err(e) => registry_error(e).into_response(),
    }
}

async fn flush_database(
    State(state): State<AppState>,
    Path(db): Path<String>,
) -> impl IntoResponse {
    let database = match state.registry.get(&db) {
        Ok(d) => d,
        Err(e) => return registry_error(e).into_response(),
    };

    let flushed = tokio::task::spawn_blocking(move || database.flush()).await;
    match flushed {
        Ok(Ok(())) => (StatusCode::OK, Json(json!({ "flushed": true }))).into_response(),
        Ok(Err(e)) => {
            tracing::error!("{e}");
            let failures: Vec<_> = e
                .failures
                .iter()
                .map(|(store, err)| json!({ "store": store, "error": err.to_string() }))
                .collect();
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "flushed": false, "failures": failures })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!("Flush task failed: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}
