#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! LedgerLink Background Worker
//!
//! Handles scheduled jobs including:
//! - QuickBooks access token keep-alive (every 30 minutes)
//! - Aggregate drift audit (hourly)
//! - Tenant repair for legacy invoices (daily at 2:00 AM UTC)
//! - Full aggregate recompute sweep (daily at 2:30 AM UTC)

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ledgerlink_reconcile::{create_pool, run_migrations, PgDocumentStore, ReconcileService};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting LedgerLink Worker");

    // The worker only makes sense against the shared store the API writes to
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool(&database_url).await?;
    run_migrations(&pool).await?;
    info!("Database pool created");

    let service = Arc::new(ReconcileService::from_env(Arc::new(PgDocumentStore::new(
        pool,
    )))?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Keep the access token fresh
    let token_service = service.clone();
    scheduler
        .add(Job::new_async("0 */30 * * * *", move |_uuid, _l| {
            let service = token_service.clone();
            Box::pin(async move {
                jobs::keep_token_alive(&service).await;
            })
        })?)
        .await?;
    info!("Scheduled: Token keep-alive (every 30 minutes)");

    // Job 2: Report aggregates that no longer match their invoices
    let audit_service = service.clone();
    scheduler
        .add(Job::new_async("0 15 * * * *", move |_uuid, _l| {
            let service = audit_service.clone();
            Box::pin(async move {
                jobs::audit_aggregates(&service).await;
            })
        })?)
        .await?;
    info!("Scheduled: Aggregate audit (hourly at :15)");

    // Job 3: Tenant repair, ahead of the sweep so repaired customers are recomputed
    let repair_service = service.clone();
    scheduler
        .add(Job::new_async("0 0 2 * * *", move |_uuid, _l| {
            let service = repair_service.clone();
            Box::pin(async move {
                info!("Running tenant repair");
                jobs::repair_tenants(&service).await;
            })
        })?)
        .await?;
    info!("Scheduled: Tenant repair (daily at 2:00 AM UTC)");

    // Job 4: Full recompute sweep
    let sweep_service = service.clone();
    scheduler
        .add(Job::new_async("0 30 2 * * *", move |_uuid, _l| {
            let service = sweep_service.clone();
            Box::pin(async move {
                info!("Running aggregate sweep");
                jobs::sweep_aggregates(&service).await;
            })
        })?)
        .await?;
    info!("Scheduled: Aggregate sweep (daily at 2:30 AM UTC)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("LedgerLink Worker started successfully with {} scheduled jobs", 4);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
