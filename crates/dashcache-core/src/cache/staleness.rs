use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CacheEntry, TtlClass};
use crate::config::CacheConfig;

/// Result of classifying a cache entry against its TTL class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "UPPERCASE")]
pub enum Freshness {
    /// Younger than the TTL. Serve without fetching.
    Fresh,
    /// Past the TTL but inside the grace window. Serve and refresh in the
    /// background.
    Stale,
    /// Past the grace window. Do not serve; await a fresh fetch.
    Expired,
}

impl Freshness {
    pub fn is_servable(self) -> bool {
        self != Freshness::Expired
    }
}

#[derive(Debug, Clone)]
pub struct StalenessPolicy {
    fast: Duration,
    normal: Duration,
    slow: Duration,
    stale_multiplier: u32,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl StalenessPolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            fast: config.ttl(TtlClass::Fast),
            normal: config.ttl(TtlClass::Normal),
            slow: config.ttl(TtlClass::Slow),
            stale_multiplier: config.stale_multiplier.max(1),
        }
    }

    pub fn ttl(&self, class: TtlClass) -> Duration {
        match class {
            TtlClass::Fast => self.fast,
            TtlClass::Normal => self.normal,
            TtlClass::Slow => self.slow,
        }
    }

    /// End of the grace window, measured from `stored_at`.
    pub fn grace(&self, class: TtlClass) -> Duration {
        self.ttl(class)
            .checked_mul(self.stale_multiplier)
            .unwrap_or(Duration::MAX)
    }

    pub fn classify(&self, entry: &CacheEntry, now: DateTime<Utc>) -> Freshness {
        self.classify_age(entry.ttl_class, entry.stored_at, now)
    }

    pub fn classify_age(
        &self,
        class: TtlClass,
        stored_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Freshness {
        // A timestamp in the future (clock skew) yields an error here; treat it as brand new.
        let age = match (now - stored_at).to_std() {
            Ok(age) => age,
            Err(_) => return Freshness::Fresh,
        };

        if age < self.ttl(class) {
            Freshness::Fresh
        } else if age < self.grace(class) {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}
