// Background workers: mirror the official API into each map's stores, and
// flush every store to disk on a fixed period.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::client::OfficialApi;
use crate::dispatch::Dispatcher;
use crate::error::{QueryError, RegistryError};
use crate::model::{Endpoint, EntityRef, Nation, Player, Record, Town};
use crate::query::{query_known, Identified};
use crate::store::{Database, Registry, Store};

/// Outcome of mirroring one endpoint of one map.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointReport {
    pub endpoint: String,
    pub listed: usize,
    pub stored: usize,
    pub failed_chunks: usize,
    pub list_error: Option<String>,
}

/// Outcome of mirroring every endpoint of one map.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub database: String,
    pub endpoints: Vec<EndpointReport>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.endpoints
            .iter()
            .all(|e| e.failed_chunks == 0 && e.list_error.is_none())
    }
}

/// Mirror one record type: list the endpoint, resolve every listed entity in
/// chunks, and write what came back into the record's store.
pub async fn sync_endpoint<R: Record>(
    api: &Arc<OfficialApi>,
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
) -> Result<EndpointReport, RegistryError> {
    let store = define_blocking::<R>(db).await?;
    let endpoint: Endpoint = R::ENDPOINT;
    let mut report = EndpointReport {
        endpoint: endpoint.to_string(),
        listed: 0,
        stored: 0,
        failed_chunks: 0,
        list_error: None,
    };

    let listed: Result<Vec<EntityRef>, QueryError> = dispatcher
        .enqueue(|| api.list(db.name(), endpoint))
        .await;
    let refs = match listed {
        Ok(refs) => refs,
        Err(e) => {
            tracing::warn!(database = db.name(), %endpoint, "listing failed: {e}");
            report.list_error = Some(e.to_string());
            return Ok(report);
        }
    };
    report.listed = refs.len();

    let outcome = query_known(dispatcher, api.query_fn::<R>(db.name(), endpoint), &refs).await;
    report.failed_chunks = outcome.errors.len();

    let now = Utc::now();
    let records: Vec<(String, R)> = outcome
        .results
        .into_iter()
        .map(|mut record| {
            record.stamp(now);
            (record.id().to_string(), record)
        })
        .collect();
    report.stored = records.len();
    store.extend(records);

    tracing::info!(
        database = db.name(),
        %endpoint,
        listed = report.listed,
        stored = report.stored,
        failed_chunks = report.failed_chunks,
        "endpoint synced"
    );
    Ok(report)
}

/// The record's store, defining it on a blocking thread the first time since
/// that reads its snapshot from disk.
async fn define_blocking<R: Record>(db: &Arc<Database>) -> Result<Store<R>, RegistryError> {
    if let Ok(store) = db.store(&R::STORE) {
        return Ok(store);
    }
    let db = db.clone();
    tokio::task::spawn_blocking(move || db.define(&R::STORE))
        .await
        .map_err(|e| RegistryError::Task(e.to_string()))?
}

/// Mirror towns, nations and players of one map.
pub async fn sync_database(
    api: &Arc<OfficialApi>,
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
) -> Result<SyncReport, RegistryError> {
    let endpoints = vec![
        sync_endpoint::<Town>(api, dispatcher, db).await?,
        sync_endpoint::<Nation>(api, dispatcher, db).await?,
        sync_endpoint::<Player>(api, dispatcher, db).await?,
    ];
    Ok(SyncReport {
        database: db.name().to_string(),
        endpoints,
    })
}

/// Spawn a background task that re-syncs every registered database each
/// `period`. The first pass starts immediately.
pub fn spawn_sync_worker(
    api: Arc<OfficialApi>,
    dispatcher: Dispatcher,
    registry: Arc<Registry>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            for db in registry.databases() {
                match sync_database(&api, &dispatcher, &db).await {
                    Ok(report) if !report.is_clean() => {
                        tracing::warn!(database = db.name(), "sync finished with errors");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(database = db.name(), "sync failed: {e}"),
                }
            }
        }
    })
}

/// Flush every database of `registry` on a blocking thread.
pub async fn flush_registry(registry: Arc<Registry>) -> bool {
    let flushed = tokio::task::spawn_blocking(move || registry.flush_all()).await;
    match flushed {
        Ok(Ok(())) => true,
        Ok(Err(failures)) => {
            for f in failures {
                tracing::error!("{f}");
            }
            false
        }
        Err(e) => {
            tracing::error!("flush task failed: {e}");
            false
        }
    }
}

/// Spawn a background task that flushes the registry every `period`.
pub fn spawn_flush_worker(registry: Arc<Registry>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if flush_registry(registry.clone()).await {
                tracing::debug!("periodic flush complete");
            }
        }
    })
}
