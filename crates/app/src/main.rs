mod app_token;
mod csrf;
mod lifecycle;
mod maintenance;
mod problem;
mod reporting;
mod router;
mod signature;
mod telemetry;
mod webhook;

#[cfg(test)]
mod test_support;

use std::{net::SocketAddr, sync::Arc};

use redeem_ledger_storage::Database;
use redeem_ledger_twitch::{HelixClient, TwitchOAuthClient};
use redeem_ledger_util::{load_env_file, AppConfig};
use tracing::{info, warn};
use url::Url;

use crate::app_token::AppTokenProvider;
use crate::csrf::{CookieSettings, CsrfGuard};
use crate::lifecycle::{LifecycleSettings, SubscriptionLifecycle};
use crate::maintenance::MaintenanceWorker;
use crate::router::system_clock;
use crate::webhook::IngestionPipeline;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "storage", url = %config.database_url, "database ready");

    let http = reqwest::Client::builder()
        .timeout(config.upstream_timeout)
        .connect_timeout(config.upstream_timeout)
        .build()?;
    let clock = system_clock();

    let oauth = TwitchOAuthClient::new(
        config.twitch.client_id.clone(),
        config.twitch.client_secret.clone(),
        Url::parse(&config.twitch.auth_base_url)?,
        http.clone(),
    );
    let helix = HelixClient::new(
        config.twitch.client_id.clone(),
        Url::parse(&config.twitch.helix_base_url)?,
        http,
    );
    let app_tokens = AppTokenProvider::new(oauth.clone(), database.ephemeral(), clock.clone());
    let csrf = CsrfGuard::new(
        config.csrf_secret.as_bytes(),
        config.csrf_ttl,
        CookieSettings {
            domain: config.frontend.cookie_domain.clone(),
            secure: config.frontend.cookie_secure,
        },
    );

    let lifecycle = SubscriptionLifecycle::new(
        oauth,
        helix,
        app_tokens,
        database.clone(),
        csrf,
        LifecycleSettings {
            redirect_uri: config.twitch.redirect_uri.clone(),
            website_url: config.frontend.website_url.clone(),
            webhook_secret: config.twitch.webhook_secret.clone(),
        },
        clock.clone(),
    );
    let ingestion = IngestionPipeline::new(
        database.clone(),
        Arc::from(config.twitch.webhook_secret.as_bytes()),
        config.dedup_ttl,
        clock,
    );

    let maintenance = MaintenanceWorker::new(database.clone()).spawn();

    let state = router::AppState::new(
        metrics,
        database,
        Arc::new(lifecycle),
        Arc::new(ingestion),
    );

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    maintenance.abort();
    info!(stage = "app", "server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(stage = "app", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(stage = "app", error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!(stage = "app", "shutdown signal received");
}
