//! HTTP surface of the desktop/server store.
//!
//! `/sync/*` routes are what [`RemoteStore`](crate::sync::RemoteStore)
//! talks to during a sync run; writes there are sync-origin and keep the
//! incoming `updatedAt`. `/records/*` routes are ordinary CRUD: they stamp
//! the current time and record tombstones on delete.
//!
//! # Endpoints
//!
//! - `GET /health`: Health check endpoint (no auth required)
//! - `GET /sync/tables/{table}`: Full listing of a table
//! - `PUT /sync/tables/{table}`: Sync-origin upsert of one row
//! - `DELETE /sync/tables/{table}/records/{key}`: Sync-origin removal
//! - `GET /sync/tombstones?since=`: Deletions recorded since a time
//! - `PUT /records/{table}`: Create or update a record
//! - `DELETE /records/{table}/{key}`: Delete a record

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, put},
    Json, Router,
};
use los_sync_core::ledger::epoch;
use los_sync_core::models::parse_timestamp;
use los_sync_core::{Row, Store, StoreError, TableDef, TableManager, Tombstone, Upserted};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::db::{DbError, SqliteStore};

/// Application state shared across handlers
#[derive(Clone)]
pub struct ServerState {
    store: SqliteStore,
    api_key: Option<Arc<String>>,
}

impl ServerState {
    pub fn new(store: SqliteStore, api_key: Option<String>) -> Self {
        Self {
            store,
            api_key: api_key.filter(|k| !k.is_empty()).map(Arc::new),
        }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }
}

/// Builds the server's router.
pub fn router(state: ServerState) -> Router {
    let public_routes = Router::new().route("/health", get(health));

    let protected_routes = Router::new()
        .route("/sync/tables/{table}", get(list_table).put(sync_upsert))
        .route("/sync/tables/{table}/records/{key}", delete(sync_remove))
        .route("/sync/tombstones", get(tombstones))
        .route("/records/{table}", put(put_record))
        .route("/records/{table}/{key}", delete(delete_record))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

// ============================================================================
// Errors
// ============================================================================

/// Error body returned by every failing route
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str, &'static str),
    NotFound(String),
    BadRequest(String),
    Store(StoreError),
    Db(DbError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Store(e) => ApiError::Store(e),
            DbError::InvalidRecord(msg) => ApiError::BadRequest(msg),
            other => ApiError::Db(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Unauthorized(error, message) => {
                (StatusCode::UNAUTHORIZED, error, message.to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Store(e) => match &e {
                StoreError::Unreachable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "unavailable", e.to_string())
                }
                StoreError::Rejected(_) => (StatusCode::BAD_REQUEST, "rejected", e.to_string()),
                StoreError::Malformed { .. } | StoreError::Backend(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
                }
            },
            ApiError::Db(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "database_error", e.to_string())
            }
        };
        (status, Json(ErrorBody { error, message })).into_response()
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// Bearer-token check. With no key configured every request passes.
async fn auth_middleware(
    State(state): State<ServerState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.api_key else {
        return next.run(request).await;
    };

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let verdict = match auth_header {
        Some(h) => match h.strip_prefix("Bearer ") {
            Some(key) if key == expected.as_str() => Ok(()),
            Some(_) => Err(ApiError::Unauthorized("invalid_key", "Invalid API key")),
            None => Err(ApiError::Unauthorized(
                "invalid_auth",
                "Authorization header must use Bearer scheme",
            )),
        },
        None => Err(ApiError::Unauthorized(
            "missing_auth",
            "Authorization header required",
        )),
    };

    match verdict {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint (no auth required)
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct RemoveResponse {
    removed: bool,
}

#[derive(Deserialize)]
struct TombstoneQuery {
    since: Option<String>,
}

fn table_def<'a>(state: &'a ServerState, table: &str) -> Result<&'a TableDef, ApiError> {
    state
        .store
        .catalog()
        .resolve(table)
        .map_err(|e| ApiError::NotFound(e.to_string()))
}

fn manager<'a>(
    state: &'a ServerState,
    def: &TableDef,
) -> Result<Box<dyn TableManager + 'a>, ApiError> {
    state
        .store
        .manager(def)
        .ok_or_else(|| ApiError::NotFound(format!("{} is not stored on this server", def.name)))
}

async fn list_table(
    State(state): State<ServerState>,
    Path(table): Path<String>,
) -> Result<Json<Vec<Row>>, ApiError> {
    let def = table_def(&state, &table)?;
    let rows = manager(&state, def)?.list().await?;
    Ok(Json(rows))
}

async fn sync_upsert(
    State(state): State<ServerState>,
    Path(table): Path<String>,
    Json(row): Json<Row>,
) -> Result<Json<Upserted>, ApiError> {
    let def = table_def(&state, &table)?;
    let upserted = manager(&state, def)?.upsert(&row, true).await?;
    Ok(Json(upserted))
}

async fn sync_remove(
    State(state): State<ServerState>,
    Path((table, key)): Path<(String, String)>,
) -> Result<Json<RemoveResponse>, ApiError> {
    let def = table_def(&state, &table)?;
    let identity = def
        .identity
        .parse_key(&key)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let removed = manager(&state, def)?.remove(&identity).await?;
    Ok(Json(RemoveResponse { removed }))
}

async fn tombstones(
    State(state): State<ServerState>,
    Query(query): Query<TombstoneQuery>,
) -> Result<Json<Vec<Tombstone>>, ApiError> {
    let since = match query.since {
        Some(raw) => parse_timestamp(&Value::String(raw.clone()))
            .ok_or_else(|| ApiError::BadRequest(format!("Invalid timestamp: {}", raw)))?,
        None => epoch(),
    };
    Ok(Json(state.store.tombstones_since(since).await?))
}

async fn put_record(
    State(state): State<ServerState>,
    Path(table): Path<String>,
    Json(row): Json<Row>,
) -> Result<Json<Upserted>, ApiError> {
    let def = table_def(&state, &table)?;
    Ok(Json(state.store.put_record(def, row).await?))
}

async fn delete_record(
    State(state): State<ServerState>,
    Path((table, key)): Path<(String, String)>,
) -> Result<Json<RemoveResponse>, ApiError> {
    let def = table_def(&state, &table)?;
    let identity = def
        .identity
        .parse_key(&key)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let removed = state.store.delete_record(def, &identity).await?;
    Ok(Json(RemoveResponse { removed }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use los_sync_core::{Catalog, Layout, Side};
    use serde_json::json;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    async fn app(api_key: Option<&str>) -> (Router, TempDir) {
        let dir = tempdir().unwrap();
        let pool = init_db(&dir.path().join("server.db")).await.unwrap();
        let catalog = Arc::new(Catalog::builtin().unwrap());
        let store = SqliteStore::new(pool, Side::Remote, Layout::Document, catalog);
        (router(ServerState::new(store, api_key.map(str::to_string))), dir)
    }

    async fn send(app: &Router, request: HttpRequest<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> HttpRequest<Body> {
        HttpRequest::get(uri).body(Body::empty()).unwrap()
    }

    fn put_json(uri: &str, body: Value) -> HttpRequest<Body> {
        HttpRequest::put(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn delete(uri: &str) -> HttpRequest<Body> {
        HttpRequest::delete(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let (app, _dir) = app(Some("secret")).await;
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_auth_required_when_key_configured() {
        let (app, _dir) = app(Some("secret")).await;

        let (status, body) = send(&app, get("/sync/tables/Tasks")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "missing_auth");

        let request = HttpRequest::get("/sync/tables/Tasks")
            .header(header::AUTHORIZATION, "Bearer nope")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_key");

        let request = HttpRequest::get("/sync/tables/Tasks")
            .header(header::AUTHORIZATION, "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_sync_upsert_keeps_timestamp() {
        let (app, _dir) = app(None).await;
        let task = json!({"uuid": "t1", "text": "a", "updatedAt": "2024-03-14T09:00:00.000Z"});

        let (status, body) = send(&app, put_json("/sync/tables/Tasks", task.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["change"], "inserted");

        let (_, body) = send(&app, get("/sync/tables/tasks")).await;
        assert_eq!(body, json!([task]));
    }

    #[tokio::test]
    async fn test_crud_delete_is_visible_as_tombstone() {
        let (app, _dir) = app(None).await;

        let (status, body) = send(&app, put_json("/records/Tasks", json!({"text": "new"}))).await;
        assert_eq!(status, StatusCode::OK);
        let uuid = body["row"]["uuid"].as_str().unwrap().to_string();
        assert!(body["row"]["updatedAt"].is_string());

        let (status, body) = send(&app, delete(&format!("/records/Tasks/{}", uuid))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], true);

        let (_, body) = send(&app, get("/sync/tombstones?since=2000-01-01T00:00:00.000Z")).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["table"], "Tasks");
        assert_eq!(body[0]["identity"], json!(uuid));

        let (_, body) = send(&app, get("/sync/tables/Tasks")).await;
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_sync_remove_reports_absent_rows() {
        let (app, _dir) = app(None).await;
        send(
            &app,
            put_json("/sync/tables/UserSettings", json!({"settingKey": "theme", "value": 1})),
        )
        .await;

        let (_, body) = send(&app, delete("/sync/tables/UserSettings/records/theme")).await;
        assert_eq!(body["removed"], true);
        let (_, body) = send(&app, delete("/sync/tables/UserSettings/records/theme")).await;
        assert_eq!(body["removed"], false);

        // Sync-origin removal leaves no tombstone.
        let (_, body) = send(&app, get("/sync/tombstones")).await;
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (app, _dir) = app(None).await;

        let (status, body) = send(&app, get("/sync/tables/Nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        // Habit rows only exist nested inside daily notes here.
        let (status, _) = send(&app, get("/sync/tables/BooleanHabits")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, put_json("/sync/tables/Tasks", json!({"text": "no id"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "rejected");

        let (status, _) = send(&app, get("/sync/tombstones?since=yesterday")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
