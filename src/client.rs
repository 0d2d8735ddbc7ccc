// HTTP client for the official game-data API.
//
// Every method performs exactly one request and does no rate limiting of its
// own: callers run these calls through the `Dispatcher`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::error::QueryError;
use crate::metrics;
use crate::model::{Endpoint, EntityRef};

/// Client bound to one official API base URL.
#[derive(Debug, Clone)]
pub struct OfficialApi {
    client: Client,
    base_url: String,
}

impl OfficialApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, QueryError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("emcache/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| QueryError::Transport {
                url: base_url.clone(),
                message: e.to_string(),
            })?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `{base}/{map}/{endpoint}`
    pub fn endpoint_url(&self, map: &str, endpoint: Endpoint) -> String {
        format!("{}/{}/{}", self.base_url, map, endpoint.path())
    }

    /// List every entity of `endpoint` on `map`.
    pub async fn list(&self, map: &str, endpoint: Endpoint) -> Result<Vec<EntityRef>, QueryError> {
        let url = self.endpoint_url(map, endpoint);
        let started = Instant::now();
        let result = self.decode(&url, self.client.get(&url).send().await).await;
        observe(endpoint, started);
        result
    }

    /// Fetch full records for at most `QUERY_LIMIT` identifiers.
    pub async fn query<T: DeserializeOwned>(
        &self,
        map: &str,
        endpoint: Endpoint,
        ids: Vec<String>,
    ) -> Result<Vec<T>, QueryError> {
        let url = self.endpoint_url(map, endpoint);
        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .json(&json!({ "query": ids }))
            .send()
            .await;
        let result = self.decode(&url, response).await;
        observe(endpoint, started);
        result
    }

    /// Single-chunk query function for the orchestrator in `query`.
    pub fn query_fn<T>(
        self: &Arc<Self>,
        map: &str,
        endpoint: Endpoint,
    ) -> impl Fn(Vec<String>) -> BoxFuture<'static, Result<Vec<T>, QueryError>> + Send + Sync + 'static
    where
        T: DeserializeOwned + Send + 'static,
    {
        let api = self.clone();
        let map = map.to_string();
        move |ids| {
            let api = api.clone();
            let map = map.clone();
            async move { api.query(&map, endpoint, ids).await }.boxed()
        }
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        url: &str,
        response: reqwest::Result<reqwest::Response>,
    ) -> Result<T, QueryError> {
        let response = response.map_err(|e| QueryError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(QueryError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response.json().await.map_err(|e| QueryError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

fn observe(endpoint: Endpoint, started: Instant) {
    metrics::REMOTE_REQUEST_DURATION_SECONDS
        .with_label_values(&[endpoint.path()])
        .observe(started.elapsed().as_secs_f64());
}
