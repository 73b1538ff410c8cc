//! Tunable thresholds for activity detection.
//!
//! The defaults were tuned against real hardware; they are not fixed law.
//! Durations are expressed in milliseconds so a TOML file stays readable.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{DetectError, Result};

/// Consecutive raw-active polls before a Bluetooth device reports active.
pub const DEFAULT_ACTIVATION_CHECKS: u32 = 2;

/// Consecutive raw-inactive polls before a Bluetooth device reports inactive.
pub const DEFAULT_DEACTIVATION_CHECKS: u32 = 4;

/// Deactivation debounce under normal conditions.
pub const DEFAULT_DEBOUNCE_MS: u64 = 3_000;

/// Deactivation debounce while the raw signal is flapping.
pub const DEFAULT_EXTENDED_DEBOUNCE_MS: u64 = 8_000;

/// Power-management hold after the last observed activity.
pub const DEFAULT_ACTIVITY_HOLD_MS: u64 = 5_000;

/// Transitions tolerated inside the rapid-change window.
pub const DEFAULT_RAPID_CHANGE_THRESHOLD: u32 = 5;

/// Rolling window for counting raw transitions.
pub const DEFAULT_RAPID_CHANGE_WINDOW_MS: u64 = 10_000;

/// Upper bound for the consecutive-check counters.
pub const DEFAULT_COUNTER_CAP: u32 = 16;

/// Re-poll interval for the event-driven monitor while a Bluetooth device is
/// still settling.
pub const DEFAULT_RECHECK_INTERVAL_MS: u64 = 500;

/// Session volume at or below this is treated as silent.
pub const DEFAULT_VOLUME_EPSILON: f32 = 0.001;

/// Top-level configuration for the detector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectConfig {
    pub fusion: FusionConfig,
    pub stabilizer: StabilizerConfig,
    pub classifier: ClassifierConfig,
}

impl DetectConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DetectError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| DetectError::Config(e.to_string()))
    }
}

/// Signal fusion settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub volume_epsilon: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            volume_epsilon: DEFAULT_VOLUME_EPSILON,
        }
    }
}

/// Bluetooth debounce and hysteresis settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizerConfig {
    pub activation_checks: u32,
    pub deactivation_checks: u32,
    pub debounce_ms: u64,
    pub extended_debounce_ms: u64,
    pub activity_hold_ms: u64,
    pub rapid_change_threshold: u32,
    pub rapid_change_window_ms: u64,
    pub counter_cap: u32,
    pub recheck_interval_ms: u64,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            activation_checks: DEFAULT_ACTIVATION_CHECKS,
            deactivation_checks: DEFAULT_DEACTIVATION_CHECKS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            extended_debounce_ms: DEFAULT_EXTENDED_DEBOUNCE_MS,
            activity_hold_ms: DEFAULT_ACTIVITY_HOLD_MS,
            rapid_change_threshold: DEFAULT_RAPID_CHANGE_THRESHOLD,
            rapid_change_window_ms: DEFAULT_RAPID_CHANGE_WINDOW_MS,
            counter_cap: DEFAULT_COUNTER_CAP,
            recheck_interval_ms: DEFAULT_RECHECK_INTERVAL_MS,
        }
    }
}

impl StabilizerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn extended_debounce(&self) -> Duration {
        Duration::from_millis(self.extended_debounce_ms)
    }

    pub fn activity_hold(&self) -> Duration {
        Duration::from_millis(self.activity_hold_ms)
    }

    pub fn rapid_change_window(&self) -> Duration {
        Duration::from_millis(self.rapid_change_window_ms)
    }

    /// Never zero, so a settling device cannot spin the monitor.
    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.recheck_interval_ms.max(10))
    }

    /// The cap never drops below either check threshold.
    pub(crate) fn effective_counter_cap(&self) -> u32 {
        self.counter_cap
            .max(self.activation_checks)
            .max(self.deactivation_checks)
    }
}

/// Device classifier settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Extra case-insensitive name fragments treated as Bluetooth audio.
    pub extra_name_patterns: Vec<String>,
}
