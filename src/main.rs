use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use trackveil::api::{self, AppState};
use trackveil::config::{Config, DatabaseBackend, TrustedProxyMode};
use trackveil::storage::{CachedStorage, PostgresStorage, SqliteStorage, Storage};
use trackveil::tracking::Tracker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("trackveil=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;
    info!("Loaded configuration");

    let storage: Arc<dyn Storage> = match config.database.backend {
        DatabaseBackend::Sqlite => {
            info!("Using SQLite storage: {}", config.database.url);
            Arc::new(
                SqliteStorage::new(&config.database.url, config.database.max_connections).await?,
            )
        }
        DatabaseBackend::Postgres => {
            info!("Using PostgreSQL storage");
            Arc::new(
                PostgresStorage::new(&config.database.url, config.database.max_connections)
                    .await?,
            )
        }
    };

    info!("Initializing database...");
    storage.init().await?;
    info!("Database initialized successfully");

    let storage: Arc<dyn Storage> = if config.cache.site_cache_max_entries > 0 {
        info!(
            "Site cache enabled (max entries: {}, ttl: {}s)",
            config.cache.site_cache_max_entries, config.cache.site_cache_ttl_secs
        );
        Arc::new(CachedStorage::new(
            storage,
            config.cache.site_cache_max_entries,
            config.cache.site_cache_ttl_secs,
        ))
    } else {
        info!("Site cache disabled");
        storage
    };

    match config.client_ip.trusted_proxy_mode {
        TrustedProxyMode::None => info!("Client IP taken from the socket address"),
        TrustedProxyMode::Standard => info!(
            "Client IP taken from Forwarded/X-Forwarded-For ({} trusted proxy ranges)",
            config.client_ip.trusted_proxies.len()
        ),
        TrustedProxyMode::Cloudflare => info!("Client IP taken from CF-Connecting-IP"),
    }

    let state = AppState {
        tracker: Tracker::new(storage, config.tracking.session_timeout_secs),
        client_ip: config.client_ip.clone(),
        request_timeout: Duration::from_millis(config.tracking.request_timeout_ms),
    };
    let router = api::create_api_router(state, &config.cors);

    let addr = format!("{}:{}", config.api_server.host, config.api_server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🚀 Tracking server listening on http://{}", addr);
    info!("   - Beacons accepted at http://{}/track", addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
