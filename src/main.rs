use anyhow::Result;
use services::{
    object_gateway::LocalObjectStore, refresh_scheduler::RefreshScheduler,
    resource_service::ResourceService, resource_store::SqliteResourceStore,
    url_lifecycle::UrlLifecycleManager,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod middleware;
mod models;
mod routes;
mod services;
mod state;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting resource-links with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    // --- Schema ---
    SqliteResourceStore::migrate(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Link lifecycle ---
    let objects = Arc::new(LocalObjectStore::new(
        &cfg.storage_dir,
        cfg.public_base_url.clone(),
        cfg.signing_secret.clone(),
    ));
    let store = Arc::new(SqliteResourceStore::new(db.clone()));
    let lifecycle = UrlLifecycleManager::new(objects.clone(), store.clone(), cfg.lifecycle);
    let scheduler = RefreshScheduler::new(lifecycle.clone(), store.clone(), &cfg.lifecycle).spawn();

    let state = state::AppState {
        db,
        resources: ResourceService::new(store, objects.clone(), lifecycle),
        objects,
        jwt: Arc::new(middleware::auth::JwtVerifier::new(&cfg.jwt_secret)),
    };

    // --- Build router ---
    let app = routes::routes::routes(state, &cfg.cors_origins);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    scheduler.stop().await;
    served?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
