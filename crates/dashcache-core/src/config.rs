//! Engine configuration.
//!
//! The hosting application supplies these values at startup. Every field has
//! a default, so a host only overrides what it cares about:
//!
//! ```json
//! { "cache": { "fast_ttl_secs": 10 }, "preload": { "hover_threshold": 2 } }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::TtlClass;

/// Application name used for the default persistent cache directory
const APP_NAME: &str = "dashcache";

/// Default namespace prefix for persisted cache keys.
const DEFAULT_NAMESPACE: &str = "dashcache";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("TTL for {0:?} must be greater than zero")]
    ZeroTtl(TtlClass),

    #[error("TTL classes must be ordered fast <= normal <= slow")]
    UnorderedTtls,

    #[error("Stale multiplier must be at least 1, got {0}")]
    StaleMultiplier(u32),

    #[error("Storage namespace must not be empty")]
    EmptyNamespace,

    #[error("History capacity must be greater than zero")]
    ZeroHistory,

    #[error("Cleanup retain count {retain} exceeds history capacity {capacity}")]
    RetainExceedsCapacity { retain: usize, capacity: usize },

    #[error("Hover threshold must be greater than zero")]
    ZeroHoverThreshold,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub preload: PreloadConfig,
}

impl Config {
    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.preload.validate()
    }

    /// Default directory for the file-backed persistent tier.
    pub fn default_persist_dir() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for volatile data (live alerts, agent heartbeats)
    pub fast_ttl_secs: u64,
    /// TTL for ordinary list/detail payloads
    pub normal_ttl_secs: u64,
    /// TTL for slowly changing reference data (rule catalogues, settings)
    pub slow_ttl_secs: u64,
    /// Entries stay servable as stale until `ttl * stale_multiplier`.
    pub stale_multiplier: u32,
    /// Prefix for keys written to the persistent tier.
    pub namespace: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fast_ttl_secs: 15,
            normal_ttl_secs: 60,
            slow_ttl_secs: 300,
            stale_multiplier: 3,
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self, class: TtlClass) -> Duration {
        let secs = match class {
            TtlClass::Fast => self.fast_ttl_secs,
            TtlClass::Normal => self.normal_ttl_secs,
            TtlClass::Slow => self.slow_ttl_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for class in [TtlClass::Fast, TtlClass::Normal, TtlClass::Slow] {
            if self.ttl(class).is_zero() {
                return Err(ConfigError::ZeroTtl(class));
            }
        }
        if !(self.fast_ttl_secs <= self.normal_ttl_secs && self.normal_ttl_secs <= self.slow_ttl_secs) {
            return Err(ConfigError::UnorderedTtls);
        }
        if self.stale_multiplier < 1 {
            return Err(ConfigError::StaleMultiplier(self.stale_multiplier));
        }
        if self.namespace.is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreloadConfig {
    /// Navigation events kept in the ring buffer
    pub history_capacity: usize,
    /// Events kept by `cleanup()`
    pub cleanup_retain: usize,
    /// Hovers on the same target before it is treated as intent
    pub hover_threshold: u32,
    /// Maximum number of predicted pages returned and preloaded
    pub max_predictions: usize,
    /// Upper bound on how long idle work may wait for an idle signal
    pub idle_fallback_ms: u64,
    /// Delay before the first staggered preload
    pub stagger_base_ms: u64,
    /// Extra delay added for each subsequent staggered preload
    pub stagger_step_ms: u64,
    /// Devices reporting less memory than this never preload
    pub min_device_memory_gb: f64,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            history_capacity: 20,
            cleanup_retain: 10,
            hover_threshold: 3,
            max_predictions: 3,
            idle_fallback_ms: 2000,
            stagger_base_ms: 500,
            stagger_step_ms: 250,
            min_device_memory_gb: 2.0,
        }
    }
}

impl PreloadConfig {
    pub fn idle_fallback(&self) -> Duration {
        Duration::from_millis(self.idle_fallback_ms)
    }

    /// Delay for the `index`-th staggered preload.
    pub fn stagger_delay(&self, index: usize) -> Duration {
        let step = self.stagger_step_ms.saturating_mul(index as u64);
        Duration::from_millis(self.stagger_base_ms.saturating_add(step))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::ZeroHistory);
        }
        if self.cleanup_retain > self.history_capacity {
            return Err(ConfigError::RetainExceedsCapacity {
                retain: self.cleanup_retain,
                capacity: self.history_capacity,
            });
        }
        if self.hover_threshold == 0 {
            return Err(ConfigError::ZeroHoverThreshold);
        }
        Ok(())
    }
}
