mod admin;
mod engine;
mod ingest;
mod maintenance;
mod problem;
mod router;
mod telemetry;
mod webhook;

use std::net::SocketAddr;

use tracing::{info, warn};

use shop_pulse_storage::Database;
use shop_pulse_util::{load_env_file, AppConfig};

use crate::ingest::IngestWorker;
use crate::maintenance::MaintenanceWorker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    if config.signature_mode.is_bypassed() {
        warn!(
            stage = "app",
            env = %config.environment.as_str(),
            "webhook signature verification is DISABLED (SHOPIFY_SKIP_HMAC)"
        );
    }
    if config.webhook_secret.is_none() && !config.signature_mode.is_bypassed() {
        warn!(
            stage = "app",
            "SHOPIFY_WEBHOOK_SECRET is not set; every webhook will be rejected"
        );
    }

    let (state, receiver) = router::AppState::new(
        metrics,
        database.clone(),
        config.webhook_secret.clone(),
        config.signature_mode,
        config.admin_token.clone(),
        config.ingest_queue_capacity,
    );

    let worker = IngestWorker::new(database.clone());
    worker.clone().spawn(receiver, config.ingest_concurrency);
    MaintenanceWorker::new(database, worker, config.replay).spawn();

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
