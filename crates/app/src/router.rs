use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::mpsc;

use shop_pulse_storage::Database;
use shop_pulse_util::SignatureMode;

use crate::ingest::{IngestJob, IngestQueue};
use crate::{admin, telemetry, webhook};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    webhook_secret: Option<Arc<str>>,
    signature_mode: SignatureMode,
    admin_token: Option<Arc<str>>,
    queue: IngestQueue,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    /// Builds the shared state and the receiving half of the ingest queue,
    /// which the caller hands to an `IngestWorker`.
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        webhook_secret: Option<String>,
        signature_mode: SignatureMode,
        admin_token: Option<String>,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<IngestJob>) {
        let (queue, receiver) = IngestQueue::channel(queue_capacity);
        let state = Self {
            metrics,
            storage,
            webhook_secret: webhook_secret.map(Arc::from),
            signature_mode,
            admin_token: admin_token.map(Arc::from),
            queue,
            clock: Arc::new(Utc::now),
        };
        (state, receiver)
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn webhook_secret(&self) -> Option<&str> {
        self.webhook_secret.as_deref()
    }

    pub fn signature_mode(&self) -> SignatureMode {
        self.signature_mode
    }

    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
    }

    pub fn queue(&self) -> &IngestQueue {
        &self.queue
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/webhooks", post(webhook::handle))
        .route("/admin/tenants", post(admin::connect_tenant))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
