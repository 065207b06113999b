use std::time::Duration;

use redeem_ledger_storage::{EphemeralError, EphemeralRepository};
use redeem_ledger_twitch::{OAuthError, TwitchOAuthClient};
use thiserror::Error;
use tracing::{info, warn};

use crate::router::Clock;

pub const APP_TOKEN_KEY: &str = "twitch:app_token";

/// Hands out the app access token used for EventSub management.
///
/// Tokens come from the client credentials grant and are cached in the
/// ephemeral store for three quarters of their reported lifetime.
#[derive(Clone)]
pub struct AppTokenProvider {
    oauth: TwitchOAuthClient,
    store: EphemeralRepository,
    clock: Clock,
}

impl AppTokenProvider {
    pub fn new(oauth: TwitchOAuthClient, store: EphemeralRepository, clock: Clock) -> Self {
        Self {
            oauth,
            store,
            clock,
        }
    }

    pub async fn access_token(&self) -> Result<String, AppTokenError> {
        let now = (self.clock)();
        if let Some(cached) = self.store.get(APP_TOKEN_KEY, now).await? {
            return Ok(cached);
        }

        let token = self.oauth.app_access_token().await?;
        let ttl = cache_ttl(token.expires_in);
        if !ttl.is_zero() {
            self.store
                .put(APP_TOKEN_KEY, &token.access_token, now, ttl)
                .await?;
        }
        info!(
            stage = "oauth",
            cache_secs = ttl.as_secs(),
            "fetched app access token"
        );

        Ok(token.access_token)
    }

    /// Drops the cached token after Twitch refused it.
    pub async fn invalidate(&self) -> Result<(), AppTokenError> {
        if self.store.delete(APP_TOKEN_KEY).await? {
            warn!(stage = "oauth", "discarded rejected app access token");
        }
        Ok(())
    }
}

fn cache_ttl(expires_in: u64) -> Duration {
    Duration::from_secs(expires_in.saturating_mul(3) / 4)
}

#[derive(Debug, Error)]
pub enum AppTokenError {
    #[error("failed to obtain app access token: {0}")]
    OAuth(#[from] OAuthError),
    #[error("token cache unavailable: {0}")]
    Store(#[from] EphemeralError),
}
