use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use httpmock::MockServer;
use redeem_ledger_storage::Database;
use redeem_ledger_twitch::{HelixClient, TwitchOAuthClient};
use reqwest::Client;
use tempfile::TempDir;
use url::Url;

use crate::app_token::AppTokenProvider;
use crate::csrf::{CookieSettings, CsrfGuard};
use crate::lifecycle::{LifecycleSettings, SubscriptionLifecycle};
use crate::router::{app_router, AppState, Clock};
use crate::telemetry;
use crate::webhook::IngestionPipeline;

pub const WEBHOOK_SECRET: &str = "0123456789abcdef";

pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Opens a migrated database in a fresh temporary directory.
pub async fn test_database() -> (Database, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ledger.db");
    let url = format!("sqlite://{}", path.display());
    let database = Database::connect(&url).await.expect("connect");
    database.run_migrations().await.expect("migrations");
    (database, dir)
}

/// Fully wired application state backed by a temp database and a mock Twitch.
pub struct TestHarness {
    pub database: Database,
    pub server: MockServer,
    pub state: AppState,
    pub now: DateTime<Utc>,
    _dir: TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        let metrics = telemetry::init_metrics().expect("metrics");
        let (database, dir) = test_database().await;
        let server = MockServer::start_async().await;
        let now = fixed_now();
        let clock: Clock = Arc::new(move || now);
        let http = Client::new();

        let oauth = TwitchOAuthClient::new(
            "client",
            "client-secret",
            Url::parse(&server.url("/oauth2/")).expect("oauth url"),
            http.clone(),
        );
        let helix = HelixClient::new(
            "client",
            Url::parse(&server.url("/helix/")).expect("helix url"),
            http,
        );
        let app_tokens = AppTokenProvider::new(oauth.clone(), database.ephemeral(), clock.clone());
        let csrf = CsrfGuard::new(
            b"csrf-test-secret",
            Duration::from_secs(600),
            CookieSettings {
                domain: None,
                secure: false,
            },
        );
        let settings = LifecycleSettings {
            redirect_uri: "https://ledger.example/callback".into(),
            website_url: "https://ledger.example".into(),
            webhook_secret: WEBHOOK_SECRET.into(),
        };

        let lifecycle = SubscriptionLifecycle::new(
            oauth,
            helix,
            app_tokens,
            database.clone(),
            csrf,
            settings,
            clock.clone(),
        );
        let ingestion = IngestionPipeline::new(
            database.clone(),
            Arc::from(WEBHOOK_SECRET.as_bytes()),
            Duration::from_secs(3600),
            clock,
        );

        let state = AppState::new(
            metrics,
            database.clone(),
            Arc::new(lifecycle),
            Arc::new(ingestion),
        );

        Self {
            database,
            server,
            state,
            now,
            _dir: dir,
        }
    }

    pub fn router(&self) -> Router {
        app_router(self.state.clone())
    }
}
