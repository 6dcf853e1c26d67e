use std::env;
use std::time::Duration;

use crate::engine::matching::RankingStrategy;
use crate::error::DispatchError;

/// Backoff policy for the transactional retry layer.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the given retry attempt (0-based), capped exponential.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(2_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub default_search_radius_km: f64,
    pub max_search_radius_km: f64,
    pub assignment_ttl: Duration,
    pub max_reassignment_attempts: u32,
    pub reassignment_delay: Duration,
    pub ranking_strategy: RankingStrategy,
    pub event_buffer_size: usize,
    pub retry_policy: RetryPolicy,
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self, DispatchError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            default_search_radius_km: parse_or_default("DEFAULT_SEARCH_RADIUS_KM", 5.0)?,
            max_search_radius_km: parse_or_default("MAX_SEARCH_RADIUS_KM", 20.0)?,
            assignment_ttl: Duration::from_secs(parse_or_default("ASSIGNMENT_TTL_SECS", 180)?),
            max_reassignment_attempts: parse_or_default("MAX_REASSIGNMENT_ATTEMPTS", 3)?,
            reassignment_delay: Duration::from_secs(parse_or_default(
                "REASSIGNMENT_DELAY_SECS",
                30,
            )?),
            ranking_strategy: ranking_from_env()?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            retry_policy: RetryPolicy {
                max_retries: parse_or_default("TX_MAX_RETRIES", 5)?,
                base_delay: Duration::from_millis(parse_or_default("TX_BASE_DELAY_MS", 50)?),
                max_delay: Duration::from_millis(parse_or_default("TX_MAX_DELAY_MS", 2_000)?),
            },
        })
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_search_radius_km: 5.0,
            max_search_radius_km: 20.0,
            assignment_ttl: Duration::from_secs(180),
            max_reassignment_attempts: 3,
            reassignment_delay: Duration::from_secs(30),
            ranking_strategy: RankingStrategy::Balanced,
            event_buffer_size: 1024,
            retry_policy: RetryPolicy::default(),
        }
    }
}

fn ranking_from_env() -> Result<RankingStrategy, DispatchError> {
    match env::var("RANKING_STRATEGY") {
        Ok(raw) => raw
            .parse::<RankingStrategy>()
            .map_err(DispatchError::Validation),
        Err(_) => Ok(RankingStrategy::Balanced),
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, DispatchError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| DispatchError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
