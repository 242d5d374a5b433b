#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! LedgerLink API Server
//!
//! Receives QuickBooks webhooks and hosts the QuickBooks connect flow.

use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use ledgerlink_api::{
    auth::{AuthStateStore, MemoryAuthStateStore, RedisAuthStateStore},
    create_router, AppState, Config,
};
use ledgerlink_reconcile::{
    create_pool, run_migrations, DocumentStore, MemoryDocumentStore, PgDocumentStore,
    ReconcileService,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!("Starting LedgerLink API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    let docs: Arc<dyn DocumentStore> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let pool = create_pool(url).await?;
            run_migrations(&pool).await?;
            tracing::info!("Database connection established");
            Arc::new(PgDocumentStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, documents are kept in memory only");
            Arc::new(MemoryDocumentStore::new())
        }
    };

    let reconcile = ReconcileService::from_env(docs)?;
    if reconcile.config.webhook_verifier_token.is_none() {
        tracing::warn!("QBO_WEBHOOK_VERIFIER_TOKEN not set, webhook signatures are not checked");
    }
    tracing::info!(
        installation_id = %reconcile.tokens.installation_id(),
        environment = ?reconcile.config.quickbooks.environment,
        "Reconciliation engine ready"
    );

    let auth_states: Arc<dyn AuthStateStore> = match &config.redis_url {
        Some(url) => {
            tracing::info!("Connecting to Redis...");
            Arc::new(RedisAuthStateStore::connect(url).await?)
        }
        None => {
            tracing::warn!("REDIS_URL not set, OAuth state is kept in memory only");
            Arc::new(MemoryAuthStateStore::new())
        }
    };

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    let bind_address = config.bind_address.clone();
    let state = AppState::new(config, Arc::new(reconcile), auth_states);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("Listening on {}", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,ledgerlink_api=debug,ledgerlink_reconcile=debug".into());

    if std::env::var("LOG_FORMAT").is_ok_and(|v| v == "json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
