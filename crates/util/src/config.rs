use std::{env, fmt, net::SocketAddr, time::Duration};

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://redeem-ledger.db";
pub const DEFAULT_TWITCH_AUTH_BASE_URL: &str = "https://id.twitch.tv/oauth2/";
pub const DEFAULT_TWITCH_HELIX_BASE_URL: &str = "https://api.twitch.tv/helix/";
pub const DEFAULT_DEDUP_TTL_SECS: u64 = 3600;
pub const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 5000;

const DEDUP_TTL_RANGE_SECS: (u64, u64) = (1800, 3600);
const WEBHOOK_SECRET_LEN: (usize, usize) = (10, 100);
const CSRF_TTL: Duration = Duration::from_secs(600);

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Credentials and endpoints used to talk to Twitch.
#[derive(Debug, Clone)]
pub struct TwitchConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub webhook_secret: String,
    pub auth_base_url: String,
    pub helix_base_url: String,
}

/// Public-facing site settings used for callbacks and cookies.
#[derive(Debug, Clone)]
pub struct FrontendConfig {
    pub website_url: String,
    pub cookie_domain: Option<String>,
    pub cookie_secure: bool,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub twitch: TwitchConfig,
    pub frontend: FrontendConfig,
    pub csrf_secret: String,
    pub csrf_ttl: Duration,
    pub dedup_ttl: Duration,
    pub upstream_timeout: Duration,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let webhook_secret = required("TWITCH_WEBHOOK_SECRET")?;
        let secret_len = webhook_secret.chars().count();
        if secret_len < WEBHOOK_SECRET_LEN.0 || secret_len > WEBHOOK_SECRET_LEN.1 {
            return Err(ConfigError::WebhookSecretLength(secret_len));
        }

        let twitch = TwitchConfig {
            client_id: required("TWITCH_CLIENT_ID")?,
            client_secret: required("TWITCH_CLIENT_SECRET")?,
            redirect_uri: required("TWITCH_REDIRECT_URI")?,
            webhook_secret,
            auth_base_url: optional("TWITCH_AUTH_BASE_URL")
                .unwrap_or_else(|| DEFAULT_TWITCH_AUTH_BASE_URL.to_string()),
            helix_base_url: optional("TWITCH_HELIX_BASE_URL")
                .unwrap_or_else(|| DEFAULT_TWITCH_HELIX_BASE_URL.to_string()),
        };

        let frontend = FrontendConfig {
            website_url: required("APP_WEBSITE_URL")?,
            cookie_domain: optional("APP_COOKIE_DOMAIN"),
            cookie_secure: parse_bool("APP_COOKIE_SECURE", true)?,
        };

        let dedup_secs = parse_u64("APP_DEDUP_TTL_SECS", DEFAULT_DEDUP_TTL_SECS)?;
        if dedup_secs < DEDUP_TTL_RANGE_SECS.0 || dedup_secs > DEDUP_TTL_RANGE_SECS.1 {
            return Err(ConfigError::InvalidValue {
                name: "APP_DEDUP_TTL_SECS",
                value: dedup_secs.to_string(),
            });
        }
        let timeout_ms = parse_u64("APP_UPSTREAM_TIMEOUT_MS", DEFAULT_UPSTREAM_TIMEOUT_MS)?;
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                name: "APP_UPSTREAM_TIMEOUT_MS",
                value: timeout_ms.to_string(),
            });
        }

        Ok(Self {
            bind_addr,
            environment,
            database_url: optional("DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            twitch,
            frontend,
            csrf_secret: required("APP_CSRF_SECRET")?,
            csrf_ttl: CSRF_TTL,
            dedup_ttl: Duration::from_secs(dedup_secs),
            upstream_timeout: Duration::from_millis(timeout_ms),
        })
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::MissingVar(name))
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional(name) {
        None => Ok(default),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue { name, value }),
        },
    }
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match optional(name) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingVar(&'static str),
    InvalidValue { name: &'static str, value: String },
    WebhookSecretLength(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingVar(name) => write!(f, "{name} must be set"),
            Self::InvalidValue { name, value } => write!(f, "invalid {name} value: {value}"),
            Self::WebhookSecretLength(len) => write!(
                f,
                "TWITCH_WEBHOOK_SECRET must be between 10 and 100 characters (got {len})"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_env::ENV_GUARD;
    use crate::DEFAULT_BIND_ADDR;

    const REQUIRED: &[(&str, &str)] = &[
        ("TWITCH_CLIENT_ID", "client"),
        ("TWITCH_CLIENT_SECRET", "client-secret"),
        ("TWITCH_REDIRECT_URI", "https://ledger.example/callback"),
        ("TWITCH_WEBHOOK_SECRET", "0123456789abcdef"),
        ("APP_WEBSITE_URL", "https://ledger.example"),
        ("APP_CSRF_SECRET", "csrf-secret"),
    ];

    const OPTIONAL: &[&str] = &[
        "APP_ENV",
        "APP_BIND_ADDR",
        "DATABASE_URL",
        "TWITCH_AUTH_BASE_URL",
        "TWITCH_HELIX_BASE_URL",
        "APP_COOKIE_DOMAIN",
        "APP_COOKIE_SECURE",
        "APP_DEDUP_TTL_SECS",
        "APP_UPSTREAM_TIMEOUT_MS",
    ];

    fn reset_env() {
        for (name, value) in REQUIRED {
            env::set_var(name, value);
        }
        for name in OPTIONAL {
            env::remove_var(name);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        reset_env();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.twitch.auth_base_url, DEFAULT_TWITCH_AUTH_BASE_URL);
        assert_eq!(config.dedup_ttl, Duration::from_secs(DEFAULT_DEDUP_TTL_SECS));
        assert!(config.frontend.cookie_secure);
        assert!(config.frontend.cookie_domain.is_none());
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        reset_env();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        env::remove_var("APP_ENV");
    }

    #[test]
    fn parses_production_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        reset_env();
        env::set_var("APP_ENV", "production");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        env::set_var("APP_COOKIE_DOMAIN", "ledger.example");
        env::set_var("APP_COOKIE_SECURE", "false");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.frontend.cookie_domain.as_deref(), Some("ledger.example"));
        assert!(!config.frontend.cookie_secure);

        reset_env();
    }

    #[test]
    fn missing_client_id_is_reported() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        reset_env();
        env::remove_var("TWITCH_CLIENT_ID");

        let err = AppConfig::from_env().expect_err("missing client id");
        assert!(matches!(err, ConfigError::MissingVar("TWITCH_CLIENT_ID")));

        reset_env();
    }

    #[test]
    fn rejects_short_webhook_secret() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        reset_env();
        env::set_var("TWITCH_WEBHOOK_SECRET", "short");

        let err = AppConfig::from_env().expect_err("short secret");
        assert!(matches!(err, ConfigError::WebhookSecretLength(5)));

        reset_env();
    }

    #[test]
    fn rejects_dedup_ttl_outside_window() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        reset_env();
        env::set_var("APP_DEDUP_TTL_SECS", "60");

        let err = AppConfig::from_env().expect_err("ttl too short");
        assert!(matches!(
            err,
            ConfigError::InvalidValue { name: "APP_DEDUP_TTL_SECS", .. }
        ));

        reset_env();
    }
}
