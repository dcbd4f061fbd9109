use std::str::FromStr;
use std::time::Duration;

use crate::auth::ApiKeys;
use crate::persistence::DatabaseConfig;

/// Engine-wide tunables. Per-user limits live in `RiskPolicy`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Monitor
    pub monitor_interval_seconds: u64, // Period of the exit-condition sweep
    pub monitor_workers: usize,        // Concurrent settlements per tick
    pub lease_ttl_seconds: u64,        // Position lease auto-expiry
    pub price_cache_ttl_seconds: u64,
    pub price_fetch_timeout_milliseconds: u64,
    pub max_holding_hours: u64, // 0 disables the timeout exit
    pub trailing_offset_percent: f64, // 0.01 = 1% behind the best price

    // Risk index
    pub index_refresh_interval_seconds: u64,
    pub index_staleness_seconds: u64,
    pub index_fallback_value: f64,
    pub index_timeout_milliseconds: u64,

    // Opening
    pub open_deadline_milliseconds: u64, // Overall deadline for one user's fan-out
    pub exchange_timeout_milliseconds: u64, // Per exchange call

    // Settlement
    pub cooldown_seconds: u64, // Per user and symbol, starts at close
    pub settlement_max_attempts: u32,
    pub settlement_backoff_milliseconds: u64,
    pub commission_rate_with_plan: f64,
    pub commission_rate_without_plan: f64,
    pub commission_currency: String,

    // Storage and admin surface
    pub database: DatabaseConfig,
    pub admin_bind_address: String,
    pub admin_api_keys: ApiKeys, // Empty disables the admin API
    pub admin_requests_per_minute: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            monitor_interval_seconds: 10,
            monitor_workers: 8,
            lease_ttl_seconds: 60,
            price_cache_ttl_seconds: 5,
            price_fetch_timeout_milliseconds: 3000,
            max_holding_hours: 72,
            trailing_offset_percent: 0.01,

            index_refresh_interval_seconds: 1800, // Every 30 minutes
            index_staleness_seconds: 7200,        // 2 hours
            index_fallback_value: 50.0,
            index_timeout_milliseconds: 5000,

            open_deadline_milliseconds: 15000,
            exchange_timeout_milliseconds: 10000,

            cooldown_seconds: 7200,
            settlement_max_attempts: 3,
            settlement_backoff_milliseconds: 500,
            commission_rate_with_plan: 0.10,
            commission_rate_without_plan: 0.20,
            commission_currency: "USDT".to_string(),

            database: DatabaseConfig::default(),
            admin_bind_address: "127.0.0.1:8080".to_string(),
            admin_api_keys: ApiKeys::default(),
            admin_requests_per_minute: 100,
        }
    }
}

/// Parse `name` and accept it only when `valid` holds; otherwise warn and keep `current`
fn env_override<T>(name: &str, current: T, valid: impl Fn(&T) -> bool) -> T
where
    T: FromStr + std::fmt::Debug,
    T::Err: std::fmt::Display,
{
    let Ok(raw) = std::env::var(name) else {
        return current;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        Ok(value) => {
            tracing::warn!(
                "Invalid {} value: {:?} (out of range), using default: {:?}",
                name,
                value,
                current
            );
            current
        }
        Err(e) => {
            tracing::warn!(
                "Failed to parse {} '{}': {}, using default: {:?}",
                name,
                raw,
                e,
                current
            );
            current
        }
    }
}

impl EngineConfig {
    /// Load `.env` if present, then read the environment
    pub fn load() -> EngineConfig {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!("No .env file loaded: {}", e);
        }
        EngineConfig::from_env()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> EngineConfig {
        let mut config = EngineConfig::default();

        config.monitor_interval_seconds = env_override(
            "MONITOR_INTERVAL_SECONDS",
            config.monitor_interval_seconds,
            |v| (1..=3600).contains(v),
        );
        config.monitor_workers =
            env_override("MONITOR_WORKERS", config.monitor_workers, |v| (1..=256).contains(v));
        config.lease_ttl_seconds =
            env_override("LEASE_TTL_SECONDS", config.lease_ttl_seconds, |v| (5..=3600).contains(v));
        config.price_cache_ttl_seconds = env_override(
            "PRICE_CACHE_TTL_SECONDS",
            config.price_cache_ttl_seconds,
            |v| (1..=300).contains(v),
        );
        config.price_fetch_timeout_milliseconds = env_override(
            "PRICE_FETCH_TIMEOUT_MILLISECONDS",
            config.price_fetch_timeout_milliseconds,
            |v| (100..=60000).contains(v),
        );
        config.max_holding_hours =
            env_override("MAX_HOLDING_HOURS", config.max_holding_hours, |v| *v <= 24 * 365);
        config.trailing_offset_percent = env_override(
            "TRAILING_OFFSET_PERCENT",
            config.trailing_offset_percent,
            |v| *v > 0.0 && *v < 0.5,
        );

        config.index_refresh_interval_seconds = env_override(
            "INDEX_REFRESH_INTERVAL_SECONDS",
            config.index_refresh_interval_seconds,
            |v| (60..=86400).contains(v),
        );
        config.index_staleness_seconds = env_override(
            "INDEX_STALENESS_SECONDS",
            config.index_staleness_seconds,
            |v| (60..=7 * 86400).contains(v),
        );
        config.index_fallback_value = env_override(
            "INDEX_FALLBACK_VALUE",
            config.index_fallback_value,
            |v| (0.0..=100.0).contains(v),
        );
        config.index_timeout_milliseconds = env_override(
            "INDEX_TIMEOUT_MILLISECONDS",
            config.index_timeout_milliseconds,
            |v| (100..=60000).contains(v),
        );

        config.open_deadline_milliseconds = env_override(
            "OPEN_DEADLINE_MILLISECONDS",
            config.open_deadline_milliseconds,
            |v| (100..=120000).contains(v),
        );
        config.exchange_timeout_milliseconds = env_override(
            "EXCHANGE_TIMEOUT_MILLISECONDS",
            config.exchange_timeout_milliseconds,
            |v| (100..=60000).contains(v),
        );

        config.cooldown_seconds =
            env_override("COOLDOWN_SECONDS", config.cooldown_seconds, |v| *v <= 7 * 86400);
        config.settlement_max_attempts = env_override(
            "SETTLEMENT_MAX_ATTEMPTS",
            config.settlement_max_attempts,
            |v| (1..=10).contains(v),
        );
        config.settlement_backoff_milliseconds = env_override(
            "SETTLEMENT_BACKOFF_MILLISECONDS",
            config.settlement_backoff_milliseconds,
            |v| (10..=60000).contains(v),
        );
        config.commission_rate_with_plan = env_override(
            "COMMISSION_RATE_WITH_PLAN",
            config.commission_rate_with_plan,
            |v| (0.0..=1.0).contains(v),
        );
        config.commission_rate_without_plan = env_override(
            "COMMISSION_RATE_WITHOUT_PLAN",
            config.commission_rate_without_plan,
            |v| (0.0..=1.0).contains(v),
        );
        if let Ok(currency) = std::env::var("COMMISSION_CURRENCY") {
            if !currency.trim().is_empty() {
                config.commission_currency = currency.trim().to_uppercase();
            }
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }
        config.database.max_connections = env_override(
            "DATABASE_MAX_CONNECTIONS",
            config.database.max_connections,
            |v| (1..=64).contains(v),
        );
        config.database.log_queries =
            env_override("DATABASE_LOG_QUERIES", config.database.log_queries, |_| true);

        if let Ok(addr) = std::env::var("ADMIN_BIND_ADDRESS") {
            config.admin_bind_address = addr;
        }
        if let Ok(raw) = std::env::var("ADMIN_API_KEYS") {
            match ApiKeys::parse(&raw) {
                Ok(keys) => config.admin_api_keys = keys,
                Err(e) => tracing::error!("Ignoring ADMIN_API_KEYS: {}", e),
            }
        }
        config.admin_requests_per_minute = env_override(
            "ADMIN_REQUESTS_PER_MINUTE",
            config.admin_requests_per_minute,
            |v| (1..=10000).contains(v),
        );

        config
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_seconds)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds)
    }

    pub fn price_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.price_cache_ttl_seconds)
    }

    pub fn price_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.price_fetch_timeout_milliseconds)
    }

    pub fn max_holding(&self) -> Option<chrono::Duration> {
        if self.max_holding_hours == 0 {
            None
        } else {
            Some(chrono::Duration::hours(self.max_holding_hours as i64))
        }
    }

    pub fn index_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.index_refresh_interval_seconds)
    }

    pub fn index_staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.index_staleness_seconds as i64)
    }

    pub fn index_timeout(&self) -> Duration {
        Duration::from_millis(self.index_timeout_milliseconds)
    }

    pub fn open_deadline(&self) -> Duration {
        Duration::from_millis(self.open_deadline_milliseconds)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_milliseconds)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_seconds as i64)
    }

    pub fn settlement_backoff(&self) -> Duration {
        Duration::from_millis(self.settlement_backoff_milliseconds)
    }
}
