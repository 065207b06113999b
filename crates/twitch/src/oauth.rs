use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Talks to the Twitch identity service (`id.twitch.tv/oauth2`).
#[derive(Clone)]
pub struct TwitchOAuthClient {
    http: Client,
    base_url: Url,
    client_id: String,
    client_secret: String,
}

/// Grant types this service requests tokens with.
#[derive(Debug, Clone, Copy)]
enum Grant<'a> {
    AuthorizationCode { code: &'a str, redirect_uri: &'a str },
    ClientCredentials,
}

impl Grant<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::AuthorizationCode { .. } => "authorization_code",
            Self::ClientCredentials => "client_credentials",
        }
    }
}

impl TwitchOAuthClient {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        base_url: Url,
        http: Client,
    ) -> Self {
        Self {
            http,
            base_url,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Builds the URL a broadcaster is sent to for consent.
    ///
    /// `state` travels back untouched on the redirect and is what ties the
    /// callback to the browser that started the login.
    pub fn authorize_url(&self, params: &AuthorizeUrlParams<'_>) -> Result<Url, OAuthError> {
        let mut url = self.base_url.join("authorize")?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", params.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &params.scopes.join(" "))
            .append_pair("state", params.state);
        Ok(url)
    }

    /// Trades the `code` from the consent redirect for a user access token.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, OAuthError> {
        self.request_token(Grant::AuthorizationCode { code, redirect_uri })
            .await
    }

    /// Requests an app access token, used for EventSub management.
    pub async fn app_access_token(&self) -> Result<TokenResponse, OAuthError> {
        self.request_token(Grant::ClientCredentials).await
    }

    async fn request_token(&self, grant: Grant<'_>) -> Result<TokenResponse, OAuthError> {
        let mut form = vec![
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", grant.name()),
        ];
        if let Grant::AuthorizationCode { code, redirect_uri } = grant {
            form.push(("code", code));
            form.push(("redirect_uri", redirect_uri));
        }

        let response = self
            .http
            .post(self.base_url.join("token")?)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::Rejected {
                grant: grant.name(),
                status,
                body,
            });
        }
        Ok(response.json().await?)
    }
}

/// Parameters required to generate an authorization URL.
pub struct AuthorizeUrlParams<'a> {
    pub state: &'a str,
    pub redirect_uri: &'a str,
    pub scopes: &'a [&'a str],
}

/// Token payload shared by the user and app grants.
///
/// App tokens carry neither a refresh token nor scopes.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Vec<String>,
    pub token_type: String,
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("invalid oauth endpoint: {0}")]
    Url(#[from] url::ParseError),
    #[error("oauth request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{grant} grant rejected with {status}: {body}")]
    Rejected {
        grant: &'static str,
        status: StatusCode,
        body: String,
    },
}
