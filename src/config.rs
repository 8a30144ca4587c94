//! Structured configuration for the coordination layer.
//!
//! The core never parses configuration text itself; callers deserialize a
//! [`CoordConfig`] from whatever source they use (TOML, env, JSON) and hand
//! it over. Every field has a default.

use crate::error::{Error, Result};
use crate::rate_limit::RateLimitWindow;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CoordConfig {
    /// Remote store address.
    pub connection_string: String,
    pub default_ttl_secs: u64,
    /// Resident memory above which the local tier is compacted. `None`
    /// disables compaction.
    pub memory_ceiling_bytes: Option<u64>,
    pub compaction_fraction: f64,
    pub compaction_interval_secs: u64,
    /// Apply this process's own invalidation messages to its local tier.
    pub self_notify: bool,
    /// Identity stamped on published invalidations.
    pub machine_id: String,
    pub breaker_failure_threshold: u32,
    pub breaker_cool_down_ms: u64,
    pub delete_retries: u32,
    pub subscription_check_interval_secs: u64,
    pub lock_poll_interval_ms: u64,
    pub rate_limit_windows: HashMap<String, RateLimitWindow>,
}

impl Default for CoordConfig {
    fn default() -> Self {
        CoordConfig {
            connection_string: "redis://127.0.0.1:6379".to_string(),
            default_ttl_secs: 300,
            memory_ceiling_bytes: None,
            compaction_fraction: 0.25,
            compaction_interval_secs: 30,
            self_notify: false,
            machine_id: uuid::Uuid::new_v4().to_string(),
            breaker_failure_threshold: 5,
            breaker_cool_down_ms: 5000,
            delete_retries: 3,
            subscription_check_interval_secs: 10,
            lock_poll_interval_ms: 100,
            rate_limit_windows: HashMap::new(),
        }
    }
}

impl CoordConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn compaction_interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_secs)
    }

    pub fn breaker_cool_down(&self) -> Duration {
        Duration::from_millis(self.breaker_cool_down_ms)
    }

    pub fn subscription_check_interval(&self) -> Duration {
        Duration::from_secs(self.subscription_check_interval_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    /// Fail fast on values no component can run with.
    pub fn validate(&self) -> Result<()> {
        if self.machine_id.is_empty() {
            return Err(Error::ConfigError("machine_id must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&self.compaction_fraction) {
            return Err(Error::ConfigError(format!(
                "compaction_fraction must be within 0.0..=1.0, got {}",
                self.compaction_fraction
            )));
        }
        if self.memory_ceiling_bytes.is_some() && self.compaction_interval_secs == 0 {
            return Err(Error::ConfigError(
                "compaction_interval_secs must be positive when a memory ceiling is set".into(),
            ));
        }
        if self.subscription_check_interval_secs == 0 {
            return Err(Error::ConfigError(
                "subscription_check_interval_secs must be positive".into(),
            ));
        }
        if self.lock_poll_interval_ms == 0 {
            return Err(Error::ConfigError(
                "lock_poll_interval_ms must be positive".into(),
            ));
        }
        for (name, window) in &self.rate_limit_windows {
            window.validate().map_err(|e| {
                Error::ConfigError(format!("rate limit window {}: {}", name, e))
            })?;
        }
        Ok(())
    }
}
