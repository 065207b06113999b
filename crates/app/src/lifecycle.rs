//! Broadcaster authorization and webhook subscription lifecycle.
//!
//! `/login` hands the browser a CSRF cookie and redirects to Twitch. `/callback`
//! checks the cookie, exchanges the code, identifies the broadcaster and then
//! swaps whatever subscription they had for a fresh one pointing at
//! `/webhook/{user_id}`.

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use cookie::Cookie;
use metrics::counter;
use redeem_ledger_core::{
    csrf_key, Subscription, REDEMPTION_EVENT_TYPE, REDEMPTION_EVENT_VERSION,
};
use redeem_ledger_storage::{Database, Reservation, SubscriptionError};
use redeem_ledger_twitch::{
    AuthorizeUrlParams, CreateSubscriptionRequest, HelixClient, HelixError, TwitchOAuthClient,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::app_token::AppTokenProvider;
use crate::csrf::{read_cookie, CsrfError, CsrfGuard, CSRF_COOKIE_NAME};
use crate::problem::ProblemResponse;
use crate::router::{AppState, Clock};

const OAUTH_SCOPES: &[&str] = &["channel:read:redemptions"];
const SUCCESS_BODY: &str = "All good.";

/// Static settings for the lifecycle manager.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub redirect_uri: String,
    pub website_url: String,
    pub webhook_secret: String,
}

/// Redirect issued by [`SubscriptionLifecycle::begin_login`].
pub struct LoginRedirect {
    pub authorize_url: Url,
    pub cookie: Cookie<'static>,
}

/// Query parameters Twitch appends to the redirect URI.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

pub struct SubscriptionLifecycle {
    oauth: TwitchOAuthClient,
    helix: HelixClient,
    app_tokens: AppTokenProvider,
    database: Database,
    csrf: CsrfGuard,
    settings: LifecycleSettings,
    clock: Clock,
}

impl SubscriptionLifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        oauth: TwitchOAuthClient,
        helix: HelixClient,
        app_tokens: AppTokenProvider,
        database: Database,
        csrf: CsrfGuard,
        settings: LifecycleSettings,
        clock: Clock,
    ) -> Self {
        Self {
            oauth,
            helix,
            app_tokens,
            database,
            csrf,
            settings,
            clock,
        }
    }

    pub fn csrf(&self) -> &CsrfGuard {
        &self.csrf
    }

    /// Issues a CSRF token and builds the Twitch authorize URL carrying it.
    pub fn begin_login(&self) -> Result<LoginRedirect, LoginError> {
        let issued = self
            .csrf
            .issue((self.clock)())
            .map_err(|err| LoginError::Internal(err.to_string()))?;

        let authorize_url = self
            .oauth
            .authorize_url(&AuthorizeUrlParams {
                state: &issued.token,
                redirect_uri: &self.settings.redirect_uri,
                scopes: OAUTH_SCOPES,
            })
            .map_err(|err| LoginError::Internal(err.to_string()))?;

        Ok(LoginRedirect {
            authorize_url,
            cookie: issued.cookie,
        })
    }

    /// Completes the authorization handshake and installs a fresh subscription.
    pub async fn complete_login(
        &self,
        query: &CallbackQuery,
        csrf_cookie: Option<&str>,
    ) -> Result<Subscription, LoginError> {
        let state = query
            .state
            .as_deref()
            .filter(|value| !value.is_empty())
            .ok_or(LoginError::InvalidRequest("missing state parameter"))?;

        self.consume_csrf(csrf_cookie, state).await?;

        if let Some(error_code) = query.error.as_deref() {
            warn!(
                stage = "oauth",
                error = error_code,
                description = query.error_description.as_deref(),
                "authorization was declined"
            );
            return Err(LoginError::UpstreamAuth(format!(
                "{error_code}: {}",
                query.error_description.as_deref().unwrap_or_default()
            )));
        }

        let code = query
            .code
            .as_deref()
            .filter(|value| !value.is_empty())
            .ok_or(LoginError::InvalidRequest("missing code parameter"))?;

        let user_token = self
            .oauth
            .exchange_code(code, &self.settings.redirect_uri)
            .await
            .map_err(|err| {
                warn!(stage = "oauth", error = %err, "failed to exchange authorization code");
                LoginError::UpstreamAuth(err.to_string())
            })?;

        let mut users = self
            .helix
            .get_users(&user_token.access_token)
            .await
            .map_err(|err| {
                warn!(stage = "oauth", error = %err, "failed to resolve authorized user");
                LoginError::UpstreamAuth(err.to_string())
            })?;
        if users.len() != 1 {
            warn!(stage = "oauth", count = users.len(), "unexpected user lookup result");
            return Err(LoginError::UpstreamAuth(format!(
                "expected exactly one user, got {}",
                users.len()
            )));
        }
        let user = users.remove(0);

        self.replace_subscription(&user.id).await
    }

    async fn consume_csrf(&self, csrf_cookie: Option<&str>, state: &str) -> Result<(), LoginError> {
        let now = (self.clock)();
        let token = self.csrf.verify(csrf_cookie, state, now).map_err(|err| {
            warn!(stage = "oauth", error = %err, "csrf verification failed");
            LoginError::CsrfMismatch(err)
        })?;

        let reservation = self
            .database
            .ephemeral()
            .set_if_absent(&csrf_key(&token), "1", now, self.csrf.ttl())
            .await
            .map_err(|err| {
                error!(stage = "oauth", error = %err, "failed to record csrf token use");
                LoginError::Persistence(err.to_string())
            })?;

        match reservation {
            Reservation::Acquired => Ok(()),
            Reservation::Held => {
                warn!(stage = "oauth", "csrf token replayed");
                Err(LoginError::CsrfMismatch(CsrfError::Mismatch))
            }
        }
    }

    async fn replace_subscription(&self, user_id: &str) -> Result<Subscription, LoginError> {
        let subscriptions = self.database.subscriptions();

        let previous = subscriptions.take_by_user(user_id).await.map_err(|err| {
            error!(stage = "oauth", %user_id, error = %err, "failed to remove stored subscription");
            LoginError::Persistence(err.to_string())
        })?;
        if let Some(previous) = previous {
            self.revoke_upstream(user_id, &previous.subscription_id).await;
        }

        let app_token = self.app_tokens.access_token().await.map_err(|err| {
            warn!(stage = "oauth", %user_id, error = %err, "failed to obtain app token");
            LoginError::UpstreamSubscribe(err.to_string())
        })?;

        let callback = format!(
            "{}/webhook/{user_id}",
            self.settings.website_url.trim_end_matches('/')
        );
        let created = match self
            .helix
            .create_eventsub_subscription(
                &app_token,
                &CreateSubscriptionRequest {
                    event_type: REDEMPTION_EVENT_TYPE,
                    version: REDEMPTION_EVENT_VERSION,
                    broadcaster_user_id: user_id,
                    callback: &callback,
                    secret: &self.settings.webhook_secret,
                },
            )
            .await
        {
            Ok(created) => created,
            Err(err) => {
                warn!(stage = "oauth", %user_id, error = %err, "failed to create eventsub subscription");
                self.discard_rejected_token(&err).await;
                return Err(LoginError::UpstreamSubscribe(err.to_string()));
            }
        };
        let Some(remote) = created.into_iter().next() else {
            warn!(stage = "oauth", %user_id, "eventsub subscription response was empty");
            return Err(LoginError::UpstreamSubscribe(
                "subscription response contained no data".to_string(),
            ));
        };

        let subscription = Subscription {
            user_id: user_id.to_string(),
            subscription_id: remote.id,
            created_at: (self.clock)(),
        };

        if let Err(err) = subscriptions.insert(&subscription).await {
            error!(
                stage = "oauth",
                %user_id,
                subscription_id = %subscription.subscription_id,
                error = %err,
                "failed to persist subscription"
            );
            self.revoke_upstream(user_id, &subscription.subscription_id)
                .await;
            return Err(match err {
                SubscriptionError::AlreadyExists => LoginError::Persistence(
                    "a concurrent login stored a subscription first".to_string(),
                ),
                SubscriptionError::Database(db_err) => LoginError::Persistence(db_err.to_string()),
            });
        }

        info!(
            stage = "oauth",
            %user_id,
            subscription_id = %subscription.subscription_id,
            "subscription installed"
        );
        Ok(subscription)
    }

    /// Deletes an upstream subscription, logging instead of failing.
    async fn revoke_upstream(&self, user_id: &str, subscription_id: &str) {
        let app_token = match self.app_tokens.access_token().await {
            Ok(token) => token,
            Err(err) => {
                warn!(stage = "oauth", %user_id, %subscription_id, error = %err, "cannot revoke subscription without app token");
                return;
            }
        };

        if let Err(err) = self
            .helix
            .delete_eventsub_subscription(&app_token, subscription_id)
            .await
        {
            warn!(stage = "oauth", %user_id, %subscription_id, error = %err, "failed to revoke upstream subscription");
            self.discard_rejected_token(&err).await;
        }
    }

    async fn discard_rejected_token(&self, err: &HelixError) {
        if !err.is_unauthorized() {
            return;
        }
        if let Err(cache_err) = self.app_tokens.invalidate().await {
            error!(stage = "oauth", error = %cache_err, "failed to discard app access token");
        }
    }
}

/// Failures of the authorization callback.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("csrf token mismatch: {0}")]
    CsrfMismatch(CsrfError),
    #[error("twitch authorization failed: {0}")]
    UpstreamAuth(String),
    #[error("twitch subscription failed: {0}")]
    UpstreamSubscribe(String),
    #[error("failed to persist subscription: {0}")]
    Persistence(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl LoginError {
    fn metric_label(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::CsrfMismatch(_) => "csrf_mismatch",
            Self::UpstreamAuth(_) => "upstream_auth_failure",
            Self::UpstreamSubscribe(_) => "upstream_subscribe_failure",
            Self::Persistence(_) => "persistence_failure",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<LoginError> for ProblemResponse {
    fn from(value: LoginError) -> Self {
        let problem_type = value.metric_label();
        match value {
            LoginError::InvalidRequest(detail) => {
                ProblemResponse::new(StatusCode::BAD_REQUEST, problem_type, detail)
            }
            LoginError::CsrfMismatch(err) => {
                ProblemResponse::new(StatusCode::BAD_REQUEST, problem_type, "csrf token mismatch")
                    .with_error(err)
            }
            LoginError::UpstreamAuth(err) => ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                problem_type,
                "twitch authorization failed",
            )
            .with_error(err),
            LoginError::UpstreamSubscribe(err) => ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                problem_type,
                "failed to create webhook subscription",
            )
            .with_error(err),
            LoginError::Persistence(err) => ProblemResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                problem_type,
                "failed to store subscription",
            )
            .with_error(err),
            LoginError::Internal(err) => ProblemResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                problem_type,
                "internal error",
            )
            .with_error(err),
        }
    }
}

pub async fn login(State(state): State<AppState>) -> Result<Response, ProblemResponse> {
    let redirect = state.lifecycle().begin_login().map_err(|err| {
        error!(stage = "oauth", error = %err, "failed to start login");
        ProblemResponse::from(err)
    })?;

    let mut response = redirect_found(redirect.authorize_url.as_str());
    append_cookie(&mut response, &redirect.cookie)?;
    Ok(response)
}

pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    headers: HeaderMap,
) -> Result<Response, ProblemResponse> {
    let lifecycle = state.lifecycle();
    let csrf_cookie = read_cookie(&headers, CSRF_COOKIE_NAME);

    match lifecycle
        .complete_login(&query, csrf_cookie.as_deref())
        .await
    {
        Ok(subscription) => {
            counter!("oauth_login_total", "result" => "success").increment(1);
            info!(
                stage = "oauth",
                user_id = %subscription.user_id,
                subscription_id = %subscription.subscription_id,
                "authorization completed"
            );
            let mut response = (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                SUCCESS_BODY,
            )
                .into_response();
            append_cookie(&mut response, &lifecycle.csrf().expired_cookie())?;
            Ok(response)
        }
        Err(err) => {
            counter!("oauth_login_total", "result" => err.metric_label()).increment(1);
            let message = err.to_string();
            let problem = ProblemResponse::from(err);
            warn!(
                stage = "oauth",
                status = problem.status().as_u16(),
                error = %message,
                "authorization callback failed"
            );
            Err(problem)
        }
    }
}

fn redirect_found(location: &str) -> Response {
    let mut response = Redirect::temporary(location).into_response();
    *response.status_mut() = StatusCode::FOUND;
    response
}

fn append_cookie(response: &mut Response, cookie: &Cookie<'_>) -> Result<(), ProblemResponse> {
    let value = HeaderValue::from_str(&cookie.to_string()).map_err(|err| {
        error!(stage = "oauth", error = %err, "cookie is not a valid header value");
        ProblemResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "failed to build cookie",
        )
    })?;
    response.headers_mut().append(header::SET_COOKIE, value);
    Ok(())
}
