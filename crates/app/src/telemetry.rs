use std::{
    fmt::Write as _,
    sync::{Mutex, OnceLock},
    time::Instant,
};

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use redeem_ledger_util::{AppConfig, Environment};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] TryInitError),
    #[error("failed to initialize prometheus recorder: {0}")]
    Metrics(#[from] BuildError),
}

static TRACING_READY: OnceLock<()> = OnceLock::new();
static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();
static RECORDER_LOCK: Mutex<()> = Mutex::new(());
static STARTED_AT: OnceLock<Instant> = OnceLock::new();

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn git_sha() -> &'static str {
    option_env!("GIT_SHA").unwrap_or("unknown")
}

/// Installs the global subscriber: pretty output locally, JSON in production.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    if TRACING_READY.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let layer = tracing_fmt::layer()
        .with_target(false)
        .with_timer(UtcTime::rfc_3339());
    let registry = tracing_subscriber::registry().with(filter);

    match config.environment {
        Environment::Production => registry.with(layer.json()).try_init()?,
        Environment::Development | Environment::Test => registry
            .with(layer.event_format(tracing_fmt::format().pretty()))
            .try_init()?,
    }

    TRACING_READY.set(()).ok();
    tracing::info!(
        stage = "app",
        env = %config.environment.as_str(),
        version = VERSION,
        git_sha = git_sha(),
        "tracing initialized"
    );
    Ok(())
}

/// Installs the Prometheus recorder on first use and hands back its handle.
///
/// Safe to call repeatedly; tests share one recorder per process.
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    if let Some(handle) = RECORDER.get() {
        return Ok(handle.clone());
    }

    let _guard = RECORDER_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(handle) = RECORDER.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    RECORDER.set(handle.clone()).ok();
    STARTED_AT.get_or_init(Instant::now);
    describe_metrics();

    Ok(handle)
}

fn describe_metrics() {
    describe_gauge!("app_build_info", "Build metadata for the running binary");
    describe_gauge!("app_uptime_seconds", "Seconds since the process started");

    describe_counter!(
        "webhook_deliveries_total",
        "EventSub webhook deliveries by outcome"
    );
    describe_counter!(
        "eventsub_invalid_signature_total",
        "EventSub deliveries whose HMAC signature did not verify"
    );
    describe_histogram!(
        "webhook_ack_latency_seconds",
        "Time to answer an EventSub delivery, by outcome"
    );
    describe_counter!("oauth_login_total", "Authorization callbacks by result");

    describe_counter!(
        "ephemeral_ttl_deleted_total",
        "Expired ephemeral keys removed by the maintenance worker"
    );
    describe_histogram!("db_checkpoint_seconds", "WAL checkpoint duration");
    describe_counter!(
        "db_busy_total",
        "SQLite busy conditions seen by maintenance, by operation"
    );
}

/// Renders the recorder snapshot plus the build and uptime gauges.
pub fn render_metrics(handle: &PrometheusHandle) -> String {
    let mut body = handle.render();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }

    let uptime = STARTED_AT
        .get()
        .map(|start| start.elapsed().as_secs_f64())
        .unwrap_or_default();
    let _ = writeln!(body, "# TYPE app_build_info gauge");
    let _ = writeln!(
        body,
        "app_build_info{{version=\"{VERSION}\",git=\"{}\"}} 1",
        git_sha()
    );
    let _ = writeln!(body, "# TYPE app_uptime_seconds gauge");
    let _ = writeln!(body, "app_uptime_seconds {uptime}");

    body
}
