use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PreloadConfig;

/// `navigator.connection.effectiveType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum EffectiveConnectionType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
}

impl EffectiveConnectionType {
    pub fn is_slow(self) -> bool {
        matches!(self, EffectiveConnectionType::Slow2g | EffectiveConnectionType::TwoG)
    }
}

impl FromStr for EffectiveConnectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slow-2g" => Ok(EffectiveConnectionType::Slow2g),
            "2g" => Ok(EffectiveConnectionType::TwoG),
            "3g" => Ok(EffectiveConnectionType::ThreeG),
            "4g" => Ok(EffectiveConnectionType::FourG),
            other => Err(format!("Unknown connection type: {}", other)),
        }
    }
}

/// Runtime signals about the device and network. `None` means the host
/// cannot tell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConditions {
    pub save_data: Option<bool>,
    pub effective_type: Option<EffectiveConnectionType>,
    pub device_memory_gb: Option<f64>,
}

pub trait NetworkConditionProbe: Send + Sync {
    fn conditions(&self) -> NetworkConditions;
}

/// Probe whose conditions are pushed by the host, e.g. from a
/// `connection.onchange` listener. Starts with no signals.
#[derive(Debug, Default)]
pub struct StaticConditionProbe {
    conditions: RwLock<NetworkConditions>,
}

impl StaticConditionProbe {
    pub fn new(conditions: NetworkConditions) -> Self {
        Self {
            conditions: RwLock::new(conditions),
        }
    }

    pub fn set(&self, conditions: NetworkConditions) {
        *self
            .conditions
            .write()
            .unwrap_or_else(PoisonError::into_inner) = conditions;
    }
}

impl NetworkConditionProbe for StaticConditionProbe {
    fn conditions(&self) -> NetworkConditions {
        *self
            .conditions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission control for all prefetching. Evaluated fresh on every call
/// since conditions change while the session runs.
pub struct PreloadGate {
    probe: Arc<dyn NetworkConditionProbe>,
    min_device_memory_gb: f64,
    opted_out: AtomicBool,
}

impl PreloadGate {
    pub fn new(probe: Arc<dyn NetworkConditionProbe>, config: &PreloadConfig) -> Self {
        Self {
            probe,
            min_device_memory_gb: config.min_device_memory_gb,
            opted_out: AtomicBool::new(false),
        }
    }

    /// Gate with no signals and default thresholds.
    pub fn permissive() -> Self {
        Self::new(
            Arc::new(StaticConditionProbe::default()),
            &PreloadConfig::default(),
        )
    }

    /// Explicit user opt-out, e.g. from a settings toggle.
    pub fn set_opt_out(&self, opted_out: bool) {
        self.opted_out.store(opted_out, Ordering::Relaxed);
    }

    pub fn can_preload(&self) -> bool {
        if self.opted_out.load(Ordering::Relaxed) {
            debug!("Preloading disabled: user opt-out");
            return false;
        }

        let conditions = self.probe.conditions();
        if conditions.save_data == Some(true) {
            debug!("Preloading disabled: save-data enabled");
            return false;
        }
        if let Some(connection) = conditions.effective_type.filter(|c| c.is_slow()) {
            debug!(?connection, "Preloading disabled: slow connection");
            return false;
        }
        if let Some(memory) = conditions
            .device_memory_gb
            .filter(|gb| *gb < self.min_device_memory_gb)
        {
            debug!(memory_gb = memory, "Preloading disabled: low device memory");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_with(conditions: NetworkConditions) -> (PreloadGate, Arc<StaticConditionProbe>) {
        let probe = Arc::new(StaticConditionProbe::new(conditions));
        (PreloadGate::new(probe.clone(), &PreloadConfig::default()), probe)
    }

    #[test]
    fn test_permissive_without_signals() {
        assert!(PreloadGate::permissive().can_preload());
    }

    #[test]
    fn test_save_data_blocks() {
        let (gate, _) = gate_with(NetworkConditions {
            save_data: Some(true),
            effective_type: Some(EffectiveConnectionType::FourG),
            device_memory_gb: Some(16.0),
        });
        assert!(!gate.can_preload());
    }

    #[test]
    fn test_slow_connection_and_low_memory_block() {
        let (gate, probe) = gate_with(NetworkConditions {
            effective_type: Some(EffectiveConnectionType::TwoG),
            ..NetworkConditions::default()
        });
        assert!(!gate.can_preload());

        probe.set(NetworkConditions {
            effective_type: Some(EffectiveConnectionType::ThreeG),
            ..NetworkConditions::default()
        });
        assert!(gate.can_preload());

        probe.set(NetworkConditions {
            device_memory_gb: Some(1.0),
            ..NetworkConditions::default()
        });
        assert!(!gate.can_preload());
    }

    #[test]
    fn test_opt_out() {
        let gate = PreloadGate::permissive();
        gate.set_opt_out(true);
        assert!(!gate.can_preload());
        gate.set_opt_out(false);
        assert!(gate.can_preload());
    }

    #[test]
    fn test_connection_type_parsing() {
        assert_eq!("slow-2g".parse(), Ok(EffectiveConnectionType::Slow2g));
        assert_eq!(" 4G ".parse(), Ok(EffectiveConnectionType::FourG));
        assert!("5g".parse::<EffectiveConnectionType>().is_err());

        let conditions: NetworkConditions =
            serde_json::from_str(r#"{"saveData": false, "effectiveType": "3g"}"#).unwrap();
        assert_eq!(conditions.effective_type, Some(EffectiveConnectionType::ThreeG));
        assert_eq!(conditions.device_memory_gb, None);
    }
}
