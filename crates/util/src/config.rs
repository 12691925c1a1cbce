use std::{env, fmt, net::SocketAddr, time::Duration};

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://shop-pulse.db";
const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_INGEST_CONCURRENCY: usize = 4;
const DEFAULT_REPLAY_INTERVAL_SECS: u64 = 60;
const DEFAULT_REPLAY_GRACE_SECS: u64 = 120;
const DEFAULT_REPLAY_MAX_ATTEMPTS: u32 = 5;

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

/// How inbound webhook signatures are treated.
///
/// `Bypassed` can only be produced by [`AppConfig::from_env`] in the
/// development environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMode {
    Enforced,
    Bypassed,
}

impl SignatureMode {
    pub fn is_bypassed(self) -> bool {
        matches!(self, Self::Bypassed)
    }
}

/// Cadence and limits for the unprocessed-event replay sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySettings {
    pub interval: Duration,
    pub grace: Duration,
    pub max_attempts: u32,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_REPLAY_INTERVAL_SECS),
            grace: Duration::from_secs(DEFAULT_REPLAY_GRACE_SECS),
            max_attempts: DEFAULT_REPLAY_MAX_ATTEMPTS,
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub webhook_secret: Option<String>,
    pub signature_mode: SignatureMode,
    pub admin_token: Option<String>,
    pub ingest_queue_capacity: usize,
    pub ingest_concurrency: usize,
    pub replay: ReplaySettings,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("environment", &self.environment)
            .field("database_url", &self.database_url)
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "<redacted>"))
            .field("signature_mode", &self.signature_mode)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .field("ingest_queue_capacity", &self.ingest_queue_capacity)
            .field("ingest_concurrency", &self.ingest_concurrency)
            .field("replay", &self.replay)
            .finish()
    }
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let webhook_secret = non_empty_var("SHOPIFY_WEBHOOK_SECRET");
        let skip_hmac = parse_flag("SHOPIFY_SKIP_HMAC")?;
        let signature_mode = match (skip_hmac, environment) {
            (false, _) => SignatureMode::Enforced,
            (true, Environment::Development) => SignatureMode::Bypassed,
            (true, other) => return Err(ConfigError::BypassNotAllowed(other)),
        };
        if environment == Environment::Production && webhook_secret.is_none() {
            return Err(ConfigError::MissingWebhookSecret);
        }

        let ingest_queue_capacity =
            parse_positive("INGEST_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?;
        let ingest_concurrency =
            parse_positive("INGEST_CONCURRENCY", DEFAULT_INGEST_CONCURRENCY)?;

        // `tokio::time::interval` panics on a zero period.
        let replay = ReplaySettings {
            interval: Duration::from_secs(parse_positive(
                "REPLAY_INTERVAL_SECS",
                DEFAULT_REPLAY_INTERVAL_SECS,
            )?),
            grace: Duration::from_secs(parse_number(
                "REPLAY_GRACE_SECS",
                DEFAULT_REPLAY_GRACE_SECS,
            )?),
            max_attempts: parse_number("REPLAY_MAX_ATTEMPTS", DEFAULT_REPLAY_MAX_ATTEMPTS)?,
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            webhook_secret,
            signature_mode,
            admin_token: non_empty_var("ADMIN_API_TOKEN"),
            ingest_queue_capacity,
            ingest_concurrency,
            replay,
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_flag(name: &'static str) -> Result<bool, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(false),
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "" | "0" | "false" | "no" => Ok(false),
            "1" | "true" | "yes" => Ok(true),
            _ => Err(ConfigError::InvalidFlag { name, value }),
        },
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
    }
}

fn parse_positive<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + Default + PartialEq,
{
    let value = parse_number(name, default)?;
    if value == T::default() {
        return Err(ConfigError::InvalidNumber {
            name,
            value: "0".to_string(),
        });
    }
    Ok(value)
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    BypassNotAllowed(Environment),
    MissingWebhookSecret,
    InvalidFlag { name: &'static str, value: String },
    InvalidNumber { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::BypassNotAllowed(env) => write!(
                f,
                "SHOPIFY_SKIP_HMAC is only honoured in development (APP_ENV={})",
                env.as_str()
            ),
            Self::MissingWebhookSecret => {
                write!(f, "SHOPIFY_WEBHOOK_SECRET must be set in production")
            }
            Self::InvalidFlag { name, value } => {
                write!(f, "{name} must be a boolean flag (got {value})")
            }
            Self::InvalidNumber { name, value } => {
                write!(f, "{name} must be a positive integer (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
pub(crate) static ENV_GUARD: std::sync::LazyLock<std::sync::Mutex<()>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(()));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_BIND_ADDR;

    const VARS: &[&str] = &[
        "APP_ENV",
        "APP_BIND_ADDR",
        "DATABASE_URL",
        "SHOPIFY_WEBHOOK_SECRET",
        "SHOPIFY_SKIP_HMAC",
        "ADMIN_API_TOKEN",
        "INGEST_QUEUE_CAPACITY",
        "INGEST_CONCURRENCY",
        "REPLAY_INTERVAL_SECS",
        "REPLAY_GRACE_SECS",
        "REPLAY_MAX_ATTEMPTS",
    ];

    fn clear_env() {
        for name in VARS {
            env::remove_var(name);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.signature_mode, SignatureMode::Enforced);
        assert!(config.webhook_secret.is_none());
        assert!(config.admin_token.is_none());
        assert_eq!(config.ingest_queue_capacity, 1024);
        assert_eq!(config.ingest_concurrency, 4);
        assert_eq!(config.replay, ReplaySettings::default());
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        clear_env();
    }

    #[test]
    fn parses_production_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        env::set_var("SHOPIFY_WEBHOOK_SECRET", "shh");
        env::set_var("REPLAY_MAX_ATTEMPTS", "9");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.webhook_secret.as_deref(), Some("shh"));
        assert_eq!(config.replay.max_attempts, 9);

        clear_env();
    }

    #[test]
    fn production_requires_webhook_secret() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");

        let err = AppConfig::from_env().expect_err("missing secret should error");
        assert!(matches!(err, ConfigError::MissingWebhookSecret));

        clear_env();
    }

    #[test]
    fn signature_bypass_only_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("SHOPIFY_SKIP_HMAC", "true");

        let config = AppConfig::from_env().expect("development bypass allowed");
        assert_eq!(config.signature_mode, SignatureMode::Bypassed);

        env::set_var("APP_ENV", "production");
        env::set_var("SHOPIFY_WEBHOOK_SECRET", "shh");
        let err = AppConfig::from_env().expect_err("production bypass rejected");
        assert!(matches!(
            err,
            ConfigError::BypassNotAllowed(Environment::Production)
        ));

        env::set_var("APP_ENV", "test");
        let err = AppConfig::from_env().expect_err("test bypass rejected");
        assert!(matches!(err, ConfigError::BypassNotAllowed(Environment::Test)));

        clear_env();
    }

    #[test]
    fn rejects_malformed_numbers_and_flags() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("INGEST_QUEUE_CAPACITY", "lots");
        let err = AppConfig::from_env().expect_err("bad number should error");
        assert!(matches!(
            err,
            ConfigError::InvalidNumber { name: "INGEST_QUEUE_CAPACITY", .. }
        ));

        clear_env();
        env::set_var("SHOPIFY_SKIP_HMAC", "maybe");
        let err = AppConfig::from_env().expect_err("bad flag should error");
        assert!(matches!(err, ConfigError::InvalidFlag { name: "SHOPIFY_SKIP_HMAC", .. }));

        clear_env();
    }

    #[test]
    fn rejects_zero_for_positive_settings() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        for name in ["INGEST_QUEUE_CAPACITY", "INGEST_CONCURRENCY", "REPLAY_INTERVAL_SECS"] {
            clear_env();
            env::set_var(name, "0");
            let err = AppConfig::from_env().expect_err("zero should error");
            assert!(
                matches!(&err, ConfigError::InvalidNumber { name: got, .. } if *got == name),
                "unexpected error for {name}: {err}"
            );
        }

        clear_env();
        env::set_var("REPLAY_GRACE_SECS", "0");
        let config = AppConfig::from_env().expect("zero grace is allowed");
        assert_eq!(config.replay.grace, Duration::ZERO);

        clear_env();
    }
}
