use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub anthropic_api_key: String,
    pub port: u16,
    pub rust_log: String,
    pub insights: InsightConfig,
}

/// Tunables for the insight engine.
#[derive(Debug, Clone, PartialEq)]
pub struct InsightConfig {
    /// Upper bound on one external generation call. Exceeding it is a failed attempt.
    pub generation_timeout: Duration,
    /// How long to wait for a generation lease held by another instance.
    pub lock_wait: Duration,
    /// JSON file replacing the built-in category policies.
    pub policy_file: Option<PathBuf>,
    pub purge_interval: Duration,
    pub recent_limit: usize,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            generation_timeout: Duration::from_secs(30),
            lock_wait: Duration::from_millis(2000),
            policy_file: None,
            purge_interval: Duration::from_secs(3600),
            recent_limit: 10,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url: require_env("REDIS_URL")?,
            anthropic_api_key: require_env("ANTHROPIC_API_KEY")?,
            port: parse_env("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            insights: InsightConfig::from_env()?,
        })
    }
}

impl InsightConfig {
    fn from_env() -> Result<Self> {
        let defaults = InsightConfig::default();

        let timeout_secs: u64 = parse_env(
            "INSIGHT_GENERATION_TIMEOUT_SECS",
            defaults.generation_timeout.as_secs(),
        )?;
        if timeout_secs == 0 {
            anyhow::bail!("INSIGHT_GENERATION_TIMEOUT_SECS must be greater than zero");
        }

        let lock_wait_ms: u64 = parse_env(
            "INSIGHT_LOCK_WAIT_MS",
            u64::try_from(defaults.lock_wait.as_millis()).unwrap_or(u64::MAX),
        )?;
        let purge_secs: u64 = parse_env(
            "INSIGHT_PURGE_INTERVAL_SECS",
            defaults.purge_interval.as_secs(),
        )?;
        if purge_secs == 0 {
            anyhow::bail!("INSIGHT_PURGE_INTERVAL_SECS must be greater than zero");
        }

        Ok(InsightConfig {
            generation_timeout: Duration::from_secs(timeout_secs),
            lock_wait: Duration::from_millis(lock_wait_ms),
            policy_file: std::env::var("INSIGHT_POLICY_FILE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            purge_interval: Duration::from_secs(purge_secs),
            recent_limit: parse_env("INSIGHT_RECENT_LIMIT", defaults.recent_limit)?,
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} has an invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}
