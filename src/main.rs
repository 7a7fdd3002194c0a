use axum::response::Json;
use axum::routing::get;
use axum::Router;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;
use log::{info, warn};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use ragserver::config::AppConfig;
use ragserver::providers::ProviderRegistry;
use ragserver::secrets::SecretsManager;
use ragserver::shared::state::{AppState, TenantWorkLimits};
use ragserver::vector::VectorStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,hyper=warn,reqwest=warn,tower_http=warn");
    }
    env_logger::init();

    let config = AppConfig::from_env();
    if config.database_url.is_empty() {
        anyhow::bail!("DATABASE_URL is required");
    }

    let manager = ConnectionManager::<PgConnection>::new(&config.database_url);
    let pool = Pool::builder()
        .max_size(10)
        .build(manager)
        .map_err(|e| anyhow::anyhow!("failed to create database pool: {}", e))?;

    let secrets = Arc::new(SecretsManager::from_env()?);
    if secrets.is_enabled() {
        info!("Secret store configured, tenant credentials served from Vault");
    }

    let cache = match &config.redis_url {
        Some(url) => match redis::Client::open(url.as_str()) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!("Failed to open cache client ({}), continuing without", e);
                None
            }
        },
        None => None,
    };

    let providers = Arc::new(ProviderRegistry::new(pool.clone(), Arc::clone(&secrets)));
    let vectors = Arc::new(VectorStore::new(&config));
    let ingest_limits = Arc::new(TenantWorkLimits::new(config.ingests_per_tenant));

    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState {
        conn: pool,
        config,
        secrets,
        providers,
        vectors,
        cache,
        ingest_limits,
    });

    let app = Router::new()
        .route("/health", get(health))
        .nest("/api/v1", ragserver::api_router::configure_api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!("ragserver listening on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
