//! Coordinator configuration.
//!
//! Defaults suit a card processor with manual capture. Every value can be
//! overridden through `ESCROW_*` environment variables.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::Amount;
use crate::retry::RetryPolicy;
use crate::sanitize::DEFAULT_VALUE_LIMIT;
use crate::store::Retention;

/// Largest amount accepted for one authorization (999,999.99).
pub const DEFAULT_MAX_AMOUNT: Amount = Amount::from_minor(99_999_999);

/// Processor API credentials.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProcessorCredentials {
    pub api_key: String,
    pub webhook_secret: String,
}

impl fmt::Debug for ProcessorCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorCredentials")
            .field("api_key", &redact(&self.api_key))
            .field("webhook_secret", &redact(&self.webhook_secret))
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() { "<unset>" } else { "<redacted>" }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub credentials: ProcessorCredentials,

    /// Physical attempts per processor call, including the first
    pub max_attempts: u32,

    /// First retry delay; doubles on every further retry
    pub base_delay: Duration,

    /// Bound on a single processor call
    pub call_timeout: Duration,

    /// How long completed/failed states stay available for dedup
    pub completed_ttl: Duration,

    /// Age at which an unresolved pending state stops blocking new attempts
    pub stale_pending_ttl: Duration,

    /// Period of the background sweeper
    pub sweep_interval: Duration,

    pub max_amount: Amount,

    /// Longest metadata value, in chars
    pub metadata_value_limit: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            credentials: ProcessorCredentials::default(),
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            call_timeout: Duration::from_secs(30),
            completed_ttl: Duration::from_secs(60 * 60),
            stale_pending_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
            max_amount: DEFAULT_MAX_AMOUNT,
            metadata_value_limit: DEFAULT_VALUE_LIMIT,
        }
    }
}

impl CoordinatorConfig {
    pub fn credentials(mut self, credentials: ProcessorCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn completed_ttl(mut self, ttl: Duration) -> Self {
        self.completed_ttl = ttl;
        self
    }

    pub fn stale_pending_ttl(mut self, ttl: Duration) -> Self {
        self.stale_pending_ttl = ttl;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn max_amount(mut self, amount: Amount) -> Self {
        self.max_amount = amount;
        self
    }

    pub fn metadata_value_limit(mut self, limit: usize) -> Self {
        self.metadata_value_limit = limit;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.base_delay)
    }

    pub fn retention(&self) -> Retention {
        Retention {
            completed_ttl: self.completed_ttl,
            stale_pending_ttl: self.stale_pending_ttl,
        }
    }

    /// Read overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read overrides through `lookup`. Unparseable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(key) = lookup("ESCROW_PROCESSOR_API_KEY") {
            config.credentials.api_key = key;
        }
        if let Some(secret) = lookup("ESCROW_WEBHOOK_SECRET") {
            config.credentials.webhook_secret = secret;
        }
        if let Some(v) = parse_var(&lookup, "ESCROW_MAX_ATTEMPTS") {
            config.max_attempts = v;
        }
        if let Some(ms) = parse_var(&lookup, "ESCROW_BASE_DELAY_MS") {
            config.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "ESCROW_CALL_TIMEOUT_MS") {
            config.call_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var(&lookup, "ESCROW_COMPLETED_TTL_SECS") {
            config.completed_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "ESCROW_STALE_PENDING_TTL_SECS") {
            config.stale_pending_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "ESCROW_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(minor) = parse_var(&lookup, "ESCROW_MAX_AMOUNT_MINOR") {
            config.max_amount = Amount::from_minor(minor);
        }
        if let Some(limit) = parse_var(&lookup, "ESCROW_METADATA_VALUE_LIMIT") {
            config.metadata_value_limit = limit;
        }

        if config.max_attempts == 0 {
            warn!("ESCROW_MAX_ATTEMPTS is 0, using 1");
            config.max_attempts = 1;
        }
        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(name, value = %raw, "ignoring unparseable config value");
            None
        }
    }
}
