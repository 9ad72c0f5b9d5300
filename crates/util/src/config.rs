use std::{env, fmt, net::SocketAddr, str::FromStr, time::Duration};

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://outreach.db?mode=rwc";
const DEFAULT_ORPHAN_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_ORPHAN_SWEEP_INTERVAL_SECS: u64 = 180;

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

    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
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

/// Transaction isolation requested from the persistence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadCommitted => "read_committed",
            Self::Serializable => "serializable",
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "read_committed" => Ok(Self::ReadCommitted),
            "serializable" => Ok(Self::Serializable),
            _ => Err(()),
        }
    }
}

/// Connection settings for the SQLite store.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout: Duration,
    pub isolation: IsolationLevel,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 5,
            busy_timeout: Duration::from_millis(5000),
            isolation: IsolationLevel::ReadCommitted,
        }
    }
}

/// Per-provider credentials and ingestion limits for the webhook endpoint.
#[derive(Clone)]
pub struct WebhookConfig {
    pub lemlist_secret: Option<String>,
    pub postmark_secret: Option<String>,
    pub phantombuster_token: Option<String>,
    pub signature_bypass: bool,
    pub deadline: Duration,
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("lemlist_secret", &self.lemlist_secret.as_ref().map(|_| "<redacted>"))
            .field("postmark_secret", &self.postmark_secret.as_ref().map(|_| "<redacted>"))
            .field(
                "phantombuster_token",
                &self.phantombuster_token.as_ref().map(|_| "<redacted>"),
            )
            .field("signature_bypass", &self.signature_bypass)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            lemlist_secret: None,
            postmark_secret: None,
            phantombuster_token: None,
            signature_bypass: false,
            deadline: Duration::from_millis(3000),
        }
    }
}

/// Retention and reconciliation policy for orphaned events.
#[derive(Debug, Clone)]
pub struct OrphanConfig {
    pub ttl: Duration,
    pub max_attempts: u32,
    pub sweep_interval: Duration,
    pub batch_timeout: Duration,
    pub batch_limit: u32,
}

impl Default for OrphanConfig {
    fn default() -> Self {
        let ttl = Duration::from_secs(DEFAULT_ORPHAN_TTL_SECS);
        let sweep_interval = Duration::from_secs(DEFAULT_ORPHAN_SWEEP_INTERVAL_SECS);
        Self {
            ttl,
            max_attempts: OrphanConfig::attempts_covering(ttl, sweep_interval),
            sweep_interval,
            batch_timeout: Duration::from_millis(10_000),
            batch_limit: 500,
        }
    }
}

impl OrphanConfig {
    /// Fewest sweep attempts that keep an unresolved entry alive for the whole `ttl`.
    pub fn attempts_covering(ttl: Duration, sweep_interval: Duration) -> u32 {
        let interval_ms = sweep_interval.as_millis().max(1);
        let attempts = ttl.as_millis().div_ceil(interval_ms).max(1);
        u32::try_from(attempts).unwrap_or(u32::MAX)
    }

    /// How long the attempt budget lasts at one attempt per sweep.
    pub fn attempt_window(&self) -> Duration {
        self.sweep_interval.saturating_mul(self.max_attempts)
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database: DatabaseConfig,
    pub webhooks: WebhookConfig,
    pub orphans: OrphanConfig,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let database = DatabaseConfig {
            url: env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 5)?,
            busy_timeout: Duration::from_millis(parse_var("DATABASE_BUSY_TIMEOUT_MS", 5000)?),
            isolation: parse_var("DATABASE_ISOLATION", IsolationLevel::ReadCommitted)?,
        };

        let signature_bypass = parse_var("WEBHOOK_SIGNATURE_BYPASS", false)?;
        if signature_bypass && environment.is_production() {
            return Err(ConfigError::BypassInProduction);
        }

        let webhooks = WebhookConfig {
            lemlist_secret: optional_var("LEMLIST_WEBHOOK_SECRET"),
            postmark_secret: optional_var("POSTMARK_WEBHOOK_SECRET"),
            phantombuster_token: optional_var("PHANTOMBUSTER_WEBHOOK_TOKEN"),
            signature_bypass,
            deadline: Duration::from_millis(parse_var("WEBHOOK_DEADLINE_MS", 3000)?),
        };

        let ttl = Duration::from_secs(parse_var("ORPHAN_TTL_SECS", DEFAULT_ORPHAN_TTL_SECS)?);
        let sweep_secs: u64 =
            parse_var("ORPHAN_SWEEP_INTERVAL_SECS", DEFAULT_ORPHAN_SWEEP_INTERVAL_SECS)?;
        if sweep_secs == 0 {
            return Err(ConfigError::InvalidValue {
                name: "ORPHAN_SWEEP_INTERVAL_SECS",
                value: sweep_secs.to_string(),
            });
        }
        let sweep_interval = Duration::from_secs(sweep_secs);
        let orphans = OrphanConfig {
            ttl,
            max_attempts: parse_var(
                "ORPHAN_MAX_ATTEMPTS",
                OrphanConfig::attempts_covering(ttl, sweep_interval),
            )?,
            sweep_interval,
            batch_timeout: Duration::from_millis(parse_var("ORPHAN_BATCH_TIMEOUT_MS", 10_000)?),
            batch_limit: parse_var("ORPHAN_BATCH_LIMIT", 500)?,
        };
        if orphans.attempt_window() < orphans.ttl {
            return Err(ConfigError::AttemptsShorterThanTtl {
                max_attempts: orphans.max_attempts,
                required: OrphanConfig::attempts_covering(orphans.ttl, orphans.sweep_interval),
            });
        }

        Ok(Self {
            bind_addr,
            environment,
            database,
            webhooks,
            orphans,
        })
    }
}

fn optional_var(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidValue { name: &'static str, value: String },
    BypassInProduction,
    AttemptsShorterThanTtl { max_attempts: u32, required: u32 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidValue { name, value } => write!(f, "invalid {name} value: {value}"),
            Self::BypassInProduction => write!(
                f,
                "WEBHOOK_SIGNATURE_BYPASS cannot be enabled when APP_ENV is production"
            ),
            Self::AttemptsShorterThanTtl {
                max_attempts,
                required,
            } => write!(
                f,
                "ORPHAN_MAX_ATTEMPTS={max_attempts} would dead-letter orphans before ORPHAN_TTL_SECS; \
                 at least {required} attempts are needed at the configured sweep interval"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
pub(crate) static ENV_GUARD: std::sync::LazyLock<std::sync::Mutex<()>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(()));
