//! Remote backend abstraction
//!
//! The engine treats the remote store as opaque, record-oriented tables
//! reachable by id. [`RemoteBackend`] is the seam the sync engine and cache
//! drain through; [`HttpRemote`] is the production implementation speaking a
//! PostgREST-style REST dialect.

use crate::error::{OfflineError, OfflineResult};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Equality filters, ordering and limit for a list query against a remote
/// table. Column names and values are pass-through; this layer does not
/// validate schema.
#[derive(Debug, Clone, Default)]
pub struct RemoteQuery {
    pub filters: Vec<(String, String)>,
    pub order_by: Option<String>,
    pub descending: bool,
    pub limit: Option<u32>,
}

impl RemoteQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, column: &str, value: impl Into<String>) -> Self {
        self.filters.push((column.to_string(), value.into()));
        self
    }

    pub fn order_desc(mut self, column: &str) -> Self {
        self.order_by = Some(column.to_string());
        self.descending = true;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Query-string pairs in the REST dialect (`col=eq.value`,
    /// `order=col.desc`, `limit=n`).
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .filters
            .iter()
            .map(|(column, value)| (column.clone(), format!("eq.{}", value)))
            .collect();
        if let Some(column) = &self.order_by {
            let direction = if self.descending { "desc" } else { "asc" };
            pairs.push(("order".to_string(), format!("{}.{}", column, direction)));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs
    }
}

/// Record-oriented CRUD against named remote tables. Every call is fallible;
/// failures surface as [`OfflineError::Remote`] and are handled per-item by
/// the sync engine.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn select(&self, table: &str, query: &RemoteQuery) -> OfflineResult<Vec<Value>>;

    async fn fetch_by_id(&self, table: &str, id: &str) -> OfflineResult<Option<Value>>;

    async fn insert(&self, table: &str, record: &Value) -> OfflineResult<()>;

    async fn update(&self, table: &str, id: &str, record: &Value) -> OfflineResult<()>;

    async fn delete(&self, table: &str, id: &str) -> OfflineResult<()>;
}

/// Configuration for the HTTP remote backend
#[derive(Debug, Clone)]
pub struct HttpRemoteConfig {
    /// Base URL of the REST endpoint, e.g. `https://api.example.in/rest/v1`
    pub base_url: String,
    /// Project API key sent as the `apikey` header
    pub api_key: Option<String>,
    /// Bearer token for the authenticated user
    pub auth_token: Option<String>,
    /// Per-request deadline. A hung call must fail rather than wedge a sync
    /// cycle.
    pub request_timeout: Duration,
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/rest/v1".to_string(),
            api_key: None,
            auth_token: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// REST implementation of [`RemoteBackend`].
pub struct HttpRemote {
    client: reqwest::Client,
    config: HttpRemoteConfig,
}

impl HttpRemote {
    pub fn new(config: HttpRemoteConfig) -> OfflineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), table)
    }

    fn apply_auth(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(api_key) = &self.config.api_key {
            request = request.header("apikey", api_key);
        }
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }
        request
    }

    async fn check_status(
        response: reqwest::Response,
        context: &str,
    ) -> OfflineResult<reqwest::Response> {
        if !response.status().is_success() {
            return Err(OfflineError::Remote(format!(
                "{} failed with status {}",
                context,
                response.status()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl RemoteBackend for HttpRemote {
    async fn select(&self, table: &str, query: &RemoteQuery) -> OfflineResult<Vec<Value>> {
        let request = self
            .client
            .get(self.table_url(table))
            .query(&query.to_query_pairs());
        let response = self.apply_auth(request).send().await?;
        let response = Self::check_status(response, &format!("select {}", table)).await?;
        Ok(response.json().await?)
    }

    async fn fetch_by_id(&self, table: &str, id: &str) -> OfflineResult<Option<Value>> {
        let request = self
            .client
            .get(self.table_url(table))
            .query(&[("id", format!("eq.{}", id))]);
        let response = self.apply_auth(request).send().await?;
        let response = Self::check_status(response, &format!("fetch {}/{}", table, id)).await?;
        let mut rows: Vec<Value> = response.json().await?;
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(rows.swap_remove(0)))
        }
    }

    async fn insert(&self, table: &str, record: &Value) -> OfflineResult<()> {
        let request = self.client.post(self.table_url(table)).json(record);
        let response = self.apply_auth(request).send().await?;
        Self::check_status(response, &format!("insert into {}", table)).await?;
        Ok(())
    }

    async fn update(&self, table: &str, id: &str, record: &Value) -> OfflineResult<()> {
        let request = self
            .client
            .patch(self.table_url(table))
            .query(&[("id", format!("eq.{}", id))])
            .json(record);
        let response = self.apply_auth(request).send().await?;
        Self::check_status(response, &format!("update {}/{}", table, id)).await?;
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> OfflineResult<()> {
        let request = self
            .client
            .delete(self.table_url(table))
            .query(&[("id", format!("eq.{}", id))]);
        let response = self.apply_auth(request).send().await?;
        Self::check_status(response, &format!("delete {}/{}", table, id)).await?;
        Ok(())
    }
}
