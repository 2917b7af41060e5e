use rust_decimal::Decimal;
use serde::Deserialize;

use crate::engine::{EngineConfig, UnfilledMarketPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_environment")]
    pub environment: String,

    pub database_url: String,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// The single instrument this core matches.
    #[serde(default = "default_instrument")]
    pub instrument: String,

    /// TTL of a claimed idempotency key.
    #[serde(default = "default_idempotency_ttl")]
    pub idempotency_ttl_seconds: u64,

    /// Tolerance below which a remaining quantity counts as exhausted.
    /// Stored as a string and parsed on demand; "0" is correct for exact
    /// fixed-point arithmetic.
    #[serde(default = "default_match_epsilon")]
    pub match_epsilon: String,

    /// Consumption concurrency of the matcher. Fixed at 1; anything else is
    /// forced back with a warning.
    #[serde(default = "default_queue_concurrency")]
    pub queue_concurrency: usize,

    /// Depth of order book snapshots when the caller does not specify one.
    #[serde(default = "default_price_levels")]
    pub price_levels_default: usize,

    /// Default window for trade history queries.
    #[serde(default = "default_recent_trades")]
    pub recent_trades_default: i64,

    /// Terminal status for a market order that found no liquidity:
    /// "partial_fill" or "reject".
    #[serde(default = "default_unfilled_market_policy")]
    pub unfilled_market_policy: String,
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_instrument() -> String {
    "BTC-USD".to_string()
}

fn default_idempotency_ttl() -> u64 {
    86_400 // 24 hours
}

fn default_match_epsilon() -> String {
    "0".to_string()
}

fn default_queue_concurrency() -> usize {
    1
}

fn default_price_levels() -> usize {
    20
}

fn default_recent_trades() -> i64 {
    50
}

fn default_unfilled_market_policy() -> String {
    "partial_fill".to_string()
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        Ok(app_config)
    }

    pub fn match_epsilon(&self) -> anyhow::Result<Decimal> {
        Decimal::from_str_exact(&self.match_epsilon)
            .map_err(|e| anyhow::anyhow!("invalid match_epsilon {:?}: {}", self.match_epsilon, e))
    }

    pub fn unfilled_market_policy(&self) -> anyhow::Result<UnfilledMarketPolicy> {
        self.unfilled_market_policy
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
    }

    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        Ok(EngineConfig {
            match_epsilon: self.match_epsilon()?,
            unfilled_market_policy: self.unfilled_market_policy()?,
        })
    }

    /// Matching correctness depends on a single consumer; the knob exists
    /// for configuration surface parity only.
    pub fn effective_queue_concurrency(&self) -> usize {
        if self.queue_concurrency != 1 {
            tracing::warn!(
                configured = self.queue_concurrency,
                "queue_concurrency is fixed at 1, overriding"
            );
        }
        1
    }
}
