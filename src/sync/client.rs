//! HTTP client for the server's `/sync` routes.
//!
//! The server keeps daily notes as documents, so this store reports the
//! `Document` layout and exposes no managers for habit child tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use los_sync_core::models::format_timestamp;
use los_sync_core::{
    Catalog, Identity, Layout, Row, Side, Store, StoreError, TableDef, TableManager, Tombstone,
    Upserted,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;

/// Errors that can occur while setting up the remote store.
#[derive(Debug)]
pub enum RemoteError {
    /// No server URL configured
    NotConfigured,
    /// Failed to build the HTTP client or reach the server
    HttpError(reqwest::Error),
    /// Server answered with an error status
    ServerError { status: u16, message: String },
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteError::NotConfigured => write!(
                f,
                "Server not configured. Set server.server_url in config or LOS_SERVER_URL."
            ),
            RemoteError::HttpError(e) => write!(f, "HTTP error: {}", e),
            RemoteError::ServerError { status, message } => {
                write!(f, "Server error ({}): {}", status, message)
            }
        }
    }
}

impl std::error::Error for RemoteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RemoteError::HttpError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        RemoteError::HttpError(e)
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
struct RemoveResponse {
    removed: bool,
}

/// The desktop/server store, reached over HTTP.
#[derive(Clone)]
pub struct RemoteStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    catalog: Arc<Catalog>,
}

impl RemoteStore {
    /// Creates a remote store from config.
    ///
    /// Returns an error if no server URL is configured.
    pub fn from_config(config: &ServerConfig, catalog: Arc<Catalog>) -> Result<Self, RemoteError> {
        let base_url = config
            .server_url
            .clone()
            .ok_or(RemoteError::NotConfigured)?;
        Self::new(&base_url, config.api_key.clone(), catalog)
    }

    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        catalog: Arc<Catalog>,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            catalog,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Checks that the server is up (no auth required).
    pub async fn check_server(&self) -> Result<HealthResponse, RemoteError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RemoteError::ServerError {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

fn transport_error(e: reqwest::Error) -> StoreError {
    if e.is_connect() || e.is_timeout() {
        StoreError::Unreachable(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

/// Reads the JSON error body the server sends with a failure status.
async fn status_error(table: &str, response: reqwest::Response) -> StoreError {
    let status = response.status();
    let message = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| body["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| status.to_string());

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StoreError::Unreachable(format!("server refused credentials: {}", message))
        }
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            StoreError::Unreachable(message)
        }
        s if s.is_client_error() => StoreError::Rejected(format!("{}: {}", table, message)),
        _ => StoreError::Backend(format!("{}: {}", table, message)),
    }
}

#[async_trait]
impl Store for RemoteStore {
    fn side(&self) -> Side {
        Side::Remote
    }

    fn layout(&self) -> Layout {
        Layout::Document
    }

    fn manager<'a>(&'a self, table: &TableDef) -> Option<Box<dyn TableManager + 'a>> {
        let name = table.side_name(Side::Remote)?;
        Some(Box::new(RemoteTable {
            store: self,
            name: name.to_string(),
        }))
    }

    async fn tombstones_since(&self, since: DateTime<Utc>) -> Result<Vec<Tombstone>, StoreError> {
        let path = format!(
            "/sync/tombstones?since={}",
            urlencoding::encode(&format_timestamp(since))
        );
        let response = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error("tombstones", response).await);
        }
        let tombstones: Vec<Tombstone> = response.json().await.map_err(transport_error)?;

        // The wire form loses the identity kind; re-read keys against the
        // catalog so a natural key never compares equal to a uuid.
        Ok(tombstones
            .into_iter()
            .filter_map(|t| {
                let def = self.catalog.resolve(&t.table).ok()?;
                let identity = def.identity.parse_key(&t.identity.key()).ok()?;
                Some(Tombstone::new(def.name.clone(), identity, t.deleted_at))
            })
            .collect())
    }
}

struct RemoteTable<'a> {
    store: &'a RemoteStore,
    name: String,
}

impl RemoteTable<'_> {
    fn path(&self) -> String {
        format!("/sync/tables/{}", urlencoding::encode(&self.name))
    }
}

#[async_trait]
impl TableManager for RemoteTable<'_> {
    async fn list(&self) -> Result<Vec<Row>, StoreError> {
        let response = self
            .store
            .request(reqwest::Method::GET, &self.path())
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(match status_error(&self.name, response).await {
                StoreError::Rejected(reason) => StoreError::Malformed {
                    table: self.name.clone(),
                    reason,
                },
                other => other,
            });
        }

        let body: Value = response.json().await.map_err(|e| StoreError::Malformed {
            table: self.name.clone(),
            reason: e.to_string(),
        })?;
        let Value::Array(items) = body else {
            return Err(StoreError::Malformed {
                table: self.name.clone(),
                reason: "response is not an array".to_string(),
            });
        };
        items
            .into_iter()
            .map(|item| {
                Row::from_value(item).ok_or_else(|| StoreError::Malformed {
                    table: self.name.clone(),
                    reason: "array element is not an object".to_string(),
                })
            })
            .collect()
    }

    async fn upsert(&self, row: &Row, is_sync_origin: bool) -> Result<Upserted, StoreError> {
        let path = if is_sync_origin {
            self.path()
        } else {
            format!("/records/{}", urlencoding::encode(&self.name))
        };
        let response = self
            .store
            .request(reqwest::Method::PUT, &path)
            .json(row)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(&self.name, response).await);
        }
        response.json().await.map_err(transport_error)
    }

    async fn remove(&self, identity: &Identity) -> Result<bool, StoreError> {
        let path = format!(
            "{}/records/{}",
            self.path(),
            urlencoding::encode(&identity.key())
        );
        let response = self
            .store
            .request(reqwest::Method::DELETE, &path)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(&self.name, response).await);
        }
        let body: RemoveResponse = response.json().await.map_err(transport_error)?;
        Ok(body.removed)
    }
}
