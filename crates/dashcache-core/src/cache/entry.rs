use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Named time-to-live tier, picked by the caller according to how volatile
/// the data is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "UPPERCASE")]
pub enum TtlClass {
    Fast,
    Normal,
    Slow,
}

impl std::fmt::Display for TtlClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TtlClass::Fast => write!(f, "FAST"),
            TtlClass::Normal => write!(f, "NORMAL"),
            TtlClass::Slow => write!(f, "SLOW"),
        }
    }
}

/// Deepest tier currently holding an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    /// Held in memory only; the persistent mirror failed or was evicted.
    Memory,
    /// Mirrored to (or restored from) persistent storage.
    Persistent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub stored_at: DateTime<Utc>,
    pub ttl_class: TtlClass,
    pub tier: Tier,
}

impl CacheEntry {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.stored_at
    }

    /// Human readable age, e.g. "5m ago".
    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        let seconds = self.age(now).num_seconds();
        if seconds < 60 {
            // Negative ages come from clock skew
            "just now".to_string()
        } else if seconds < 3600 {
            format!("{}m ago", seconds / 60)
        } else if seconds < 86_400 {
            format!("{}h ago", seconds / 3600)
        } else {
            format!("{}d ago", seconds / 86_400)
        }
    }
}

/// On-disk layout of a persisted entry: `{"value", "storedAt", "ttlClass"}`
/// with `storedAt` in epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PersistedBlob {
    pub value: Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub stored_at: DateTime<Utc>,
    pub ttl_class: TtlClass,
}

impl PersistedBlob {
    pub fn into_entry(self, key: &str) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            value: self.value,
            stored_at: self.stored_at,
            ttl_class: self.ttl_class,
            tier: Tier::Persistent,
        }
    }
}

impl From<&CacheEntry> for PersistedBlob {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            value: entry.value.clone(),
            stored_at: entry.stored_at,
            ttl_class: entry.ttl_class,
        }
    }
}
