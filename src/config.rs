use std::{env, str::FromStr, time::Duration};

use crate::{
    error::{Error, Result},
    retry::RetryPolicy,
};

pub const DEFAULT_DRIFT_FACTOR: f64 = 0.01;
pub const DEFAULT_FIXED_SLACK: Duration = Duration::from_millis(2);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(1500);

/// Immutable coordinator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QuorumConfig {
    pub retry: RetryPolicy,
    /// Proportional clock-drift allowance subtracted from every TTL.
    pub drift_factor: f64,
    /// Fixed allowance added to the drift, covering expiry precision on the
    /// authorities.
    pub fixed_slack: Duration,
    /// Upper bound for a single authority call.
    pub command_timeout: Duration,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            drift_factor: DEFAULT_DRIFT_FACTOR,
            fixed_slack: DEFAULT_FIXED_SLACK,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl QuorumConfig {
    pub fn with_retry(mut self, retry_count: u32, retry_delay: Duration) -> Self {
        self.retry = RetryPolicy::new(retry_count, retry_delay);
        self
    }

    pub fn with_drift(mut self, drift_factor: f64, fixed_slack: Duration) -> Self {
        self.drift_factor = drift_factor;
        self.fixed_slack = fixed_slack;
        self
    }

    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.drift_factor.is_finite() || !(0.0..1.0).contains(&self.drift_factor) {
            return Err(Error::InvalidConfig {
                reason: format!("drift factor must be in [0, 1), got {}", self.drift_factor),
            });
        }
        if self.command_timeout.is_zero() {
            return Err(Error::InvalidConfig {
                reason: "command timeout must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Process configuration for the `octostore-quorum` binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub authorities: Vec<String>,
    pub quorum: QuorumConfig,
    pub bind_addr: String,
    pub database_url: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = QuorumConfig::default();

        let retry_count = match env::var("RETRY_COUNT") {
            Ok(raw) => {
                let count: i64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| anyhow::anyhow!("RETRY_COUNT must be an integer, got {:?}", raw))?;
                u32::try_from(count).map_err(|_| anyhow::anyhow!("RETRY_COUNT must be >= 0, got {}", count))?
            }
            Err(_) => defaults.retry.retry_count,
        };

        let quorum = QuorumConfig {
            retry: RetryPolicy::new(
                retry_count,
                env_millis("RETRY_DELAY_MS")?.unwrap_or(defaults.retry.retry_delay),
            ),
            drift_factor: env_parse("DRIFT_FACTOR")?.unwrap_or(defaults.drift_factor),
            fixed_slack: env_millis("FIXED_SLACK_MS")?.unwrap_or(defaults.fixed_slack),
            command_timeout: env_millis("COMMAND_TIMEOUT_MS")?.unwrap_or(defaults.command_timeout),
        };
        quorum.validate()?;

        Ok(Config {
            authorities: env::var("AUTHORITIES")
                .map(|raw| parse_authorities(&raw))
                .unwrap_or_default(),
            quorum,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:7700".to_string()),
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
        })
    }
}

/// Split a comma-separated endpoint list, dropping blanks.
pub fn parse_authorities(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|endpoint| !endpoint.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_parse<T: FromStr>(key: &str) -> anyhow::Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {:?}", key, raw)),
        Err(_) => Ok(None),
    }
}

fn env_millis(key: &str) -> anyhow::Result<Option<Duration>> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}
