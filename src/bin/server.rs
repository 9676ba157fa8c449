//! LOS Sync Server
//!
//! Serves the desktop/server side of the sync over HTTP. Records live in a
//! SQLite database in document form; deletions made through `/records`
//! are kept in the deletion log so clients can pick them up.
//!
//! # Configuration
//!
//! Environment variables:
//! - `LOS_SERVER_PORT`: Port to listen on (default: 3001)
//! - `LOS_SERVER_DATABASE`: Path to the database (default: ~/.local/share/los-server/server.db)
//! - `LOS_SERVER_API_KEY`: Bearer token clients must send (default: none, no auth)

use los_sync::db::{init_db, SqliteStore};
use los_sync::server::{router, ServerState};
use los_sync_core::{Catalog, Layout, Side};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// ============================================================================
// Configuration
// ============================================================================

/// Server configuration
#[derive(Debug, Clone)]
struct Config {
    /// Port to listen on
    port: u16,
    /// SQLite database holding the server's records
    database_path: PathBuf,
    /// Bearer token, if auth is enabled
    api_key: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let port = std::env::var("LOS_SERVER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3001);

        let database_path = std::env::var("LOS_SERVER_DATABASE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("los-server")
                    .join("server.db")
            });

        let api_key = std::env::var("LOS_SERVER_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());

        Self {
            port,
            database_path,
            api_key,
        }
    }
}

// ============================================================================
// Main
// ============================================================================

/// Logs ordinary writes as they happen.
fn spawn_change_logger(store: &SqliteStore) {
    let mut changes = store.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => tracing::info!(
                    table = %change.table,
                    key = %change.key,
                    kind = ?change.kind,
                    "Record changed"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Change log fell behind, skipped {} change(s)", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "los_server=info,los_sync=info,los_sync_core=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();

    let catalog = match Catalog::builtin() {
        Ok(catalog) => Arc::new(catalog),
        Err(e) => {
            tracing::error!("Invalid table catalog: {}", e);
            std::process::exit(1);
        }
    };

    let pool = match init_db(&config.database_path).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!("Database: {}", config.database_path.display());
    if config.api_key.is_none() {
        tracing::warn!("LOS_SERVER_API_KEY is not set - requests are not authenticated");
    }

    let store = SqliteStore::new(pool, Side::Remote, Layout::Document, catalog);
    spawn_change_logger(&store);

    let app = router(ServerState::new(store, config.api_key));

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
