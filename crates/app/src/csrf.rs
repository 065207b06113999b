use std::time::Duration;

use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use cookie::{Cookie, SameSite};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const CSRF_COOKIE_NAME: &str = "twitch_csrf";
const TOKEN_BYTES: usize = 32;

/// Cookie attributes applied to the CSRF cookie.
#[derive(Debug, Clone, Default)]
pub struct CookieSettings {
    pub domain: Option<String>,
    pub secure: bool,
}

/// Issues and checks the CSRF proof carried through the OAuth redirect.
///
/// The random token travels twice: as the OAuth `state` parameter and inside
/// an HS256-signed JWT stored in an HTTP-only cookie. The callback is accepted
/// only when both copies match and the JWT has not expired.
#[derive(Clone)]
pub struct CsrfGuard {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
    cookie: CookieSettings,
}

/// A freshly issued token plus the cookie that carries its signed copy.
pub struct IssuedCsrf {
    pub token: String,
    pub cookie: Cookie<'static>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CsrfClaims {
    token: String,
    iat: i64,
    exp: i64,
}

impl CsrfGuard {
    pub fn new(secret: &[u8], ttl: Duration, cookie: CookieSettings) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear();
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            ttl,
            cookie,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Generates a 256-bit token and its signed cookie.
    pub fn issue(&self, now: DateTime<Utc>) -> Result<IssuedCsrf, CsrfError> {
        let token = generate_token();
        let ttl_secs = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = CsrfClaims {
            token: token.clone(),
            iat: now.timestamp(),
            exp: now.timestamp().saturating_add(ttl_secs),
        };
        let jwt = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(CsrfError::Signing)?;

        let mut builder = Cookie::build((CSRF_COOKIE_NAME, jwt))
            .http_only(true)
            .path("/")
            .same_site(SameSite::Lax)
            .secure(self.cookie.secure)
            .max_age(cookie::time::Duration::seconds(ttl_secs));
        if let Some(domain) = &self.cookie.domain {
            builder = builder.domain(domain.clone());
        }

        Ok(IssuedCsrf {
            token,
            cookie: builder.build(),
        })
    }

    /// Validates the cookie JWT against the `state` echoed back by Twitch and
    /// returns the token on success.
    pub fn verify(
        &self,
        cookie_value: Option<&str>,
        state: &str,
        now: DateTime<Utc>,
    ) -> Result<String, CsrfError> {
        let jwt = cookie_value
            .filter(|value| !value.is_empty())
            .ok_or(CsrfError::MissingCookie)?;
        let claims = decode::<CsrfClaims>(jwt, &self.decoding_key, &self.validation)
            .map_err(CsrfError::Malformed)?
            .claims;

        if now.timestamp() >= claims.exp {
            return Err(CsrfError::Expired);
        }

        let matches: bool = claims.token.as_bytes().ct_eq(state.as_bytes()).into();
        if !matches {
            return Err(CsrfError::Mismatch);
        }

        Ok(claims.token)
    }

    /// Cookie instructing the browser to drop the CSRF cookie.
    pub fn expired_cookie(&self) -> Cookie<'static> {
        let mut builder = Cookie::build((CSRF_COOKIE_NAME, ""))
            .http_only(true)
            .path("/")
            .secure(self.cookie.secure);
        if let Some(domain) = &self.cookie.domain {
            builder = builder.domain(domain.clone());
        }
        let mut cookie = builder.build();
        cookie.make_removal();
        cookie
    }
}

/// Returns the value of the named cookie from the request headers.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value().to_string())
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug, Error)]
pub enum CsrfError {
    #[error("csrf cookie is missing")]
    MissingCookie,
    #[error("csrf cookie is malformed: {0}")]
    Malformed(jsonwebtoken::errors::Error),
    #[error("csrf cookie has expired")]
    Expired,
    #[error("csrf token mismatch")]
    Mismatch,
    #[error("failed to sign csrf token: {0}")]
    Signing(jsonwebtoken::errors::Error),
}
