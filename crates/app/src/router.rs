use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use redeem_ledger_storage::Database;

use crate::lifecycle::{self, SubscriptionLifecycle};
use crate::webhook::{self, IngestionPipeline};
use crate::{reporting, telemetry};

/// Source of the current time, injectable for tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    lifecycle: Arc<SubscriptionLifecycle>,
    ingestion: Arc<IngestionPipeline>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        lifecycle: Arc<SubscriptionLifecycle>,
        ingestion: Arc<IngestionPipeline>,
    ) -> Self {
        Self {
            metrics,
            storage,
            lifecycle,
            ingestion,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn lifecycle(&self) -> &SubscriptionLifecycle {
        &self.lifecycle
    }

    pub fn ingestion(&self) -> Arc<IngestionPipeline> {
        self.ingestion.clone()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/login", get(lifecycle::login))
        .route("/callback", get(lifecycle::callback))
        .route("/webhook/:user_id", post(webhook::handle))
        .route("/tax-results", get(reporting::tax_results))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}
