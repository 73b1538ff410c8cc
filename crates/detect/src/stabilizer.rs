//! Debounce and hysteresis for Bluetooth endpoints.
//!
//! Power-saving Bluetooth radios make the raw activity signal flap. A
//! microphone indicator that blinks "off" mid-sentence is worse than one that
//! turns "on" a poll late, so the rules below lean towards reporting active
//! during ambiguity:
//!
//! - **Activation** needs `activation_checks` consecutive raw-active polls.
//! - **Deactivation** needs all of: the activity hold has elapsed since the
//!   last raw-active poll, raw inactivity has persisted for the debounce
//!   interval, and `deactivation_checks` consecutive raw-inactive polls.
//! - **Flapping**: more than `rapid_change_threshold` raw transitions inside
//!   the rolling window switches the deactivation debounce to the extended
//!   interval.
//!
//! State is kept per endpoint identity for the life of the process. Entries
//! are created on first sight and never evicted.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::StabilizerConfig;

/// Debounce state of one Bluetooth endpoint.
#[derive(Debug, Clone)]
pub struct BluetoothDeviceState {
    last_raw: bool,
    reported: bool,
    /// Last raw transition.
    last_state_change: Instant,
    last_activity: Option<Instant>,
    /// Last flip of the reported state.
    last_report: Instant,
    active_checks: u32,
    inactive_checks: u32,
    /// Raw transitions inside the rolling window, oldest first.
    recent_changes: VecDeque<Instant>,
}

impl BluetoothDeviceState {
    fn new(now: Instant) -> Self {
        Self {
            last_raw: false,
            reported: false,
            last_state_change: now,
            last_activity: None,
            last_report: now,
            active_checks: 0,
            inactive_checks: 0,
            recent_changes: VecDeque::new(),
        }
    }

    /// The stabilized state last handed to callers.
    pub fn reported(&self) -> bool {
        self.reported
    }

    pub fn last_report(&self) -> Instant {
        self.last_report
    }

    /// Raw transitions counted in the current window.
    pub fn rapid_changes(&self) -> usize {
        self.recent_changes.len()
    }

    fn is_flapping(&self, config: &StabilizerConfig) -> bool {
        self.recent_changes.len() > config.rapid_change_threshold as usize
    }

    fn debounce(&self, config: &StabilizerConfig) -> Duration {
        if self.is_flapping(config) {
            config.extended_debounce()
        } else {
            config.debounce()
        }
    }

    fn prune_window(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.recent_changes.front() {
            if now.saturating_duration_since(oldest) > window {
                self.recent_changes.pop_front();
            } else {
                break;
            }
        }
    }

    fn observe(&mut self, raw: bool, now: Instant, config: &StabilizerConfig) -> bool {
        let cap = config.effective_counter_cap();

        if raw != self.last_raw {
            self.recent_changes.push_back(now);
            self.last_state_change = now;
            self.last_raw = raw;
        }
        self.prune_window(now, config.rapid_change_window());

        if raw {
            self.last_activity = Some(now);
            self.active_checks = (self.active_checks + 1).min(cap);
            self.inactive_checks = 0;
        } else {
            self.inactive_checks = (self.inactive_checks + 1).min(cap);
            self.active_checks = 0;
        }

        if !self.reported && raw && self.active_checks >= config.activation_checks {
            self.reported = true;
            self.last_report = now;
        } else if self.reported && !raw {
            let hold_elapsed = self
                .last_activity
                .map_or(true, |t| now.saturating_duration_since(t) >= config.activity_hold());
            let debounce_elapsed =
                now.saturating_duration_since(self.last_state_change) >= self.debounce(config);

            if hold_elapsed
                && debounce_elapsed
                && self.inactive_checks >= config.deactivation_checks
            {
                self.reported = false;
                self.last_report = now;
            }
        }

        self.reported
    }
}

/// Owns the per-device debounce state.
#[derive(Debug, Default)]
pub struct BluetoothStabilizer {
    config: StabilizerConfig,
    devices: Mutex<HashMap<String, BluetoothDeviceState>>,
}

impl BluetoothStabilizer {
    pub fn new(config: StabilizerConfig) -> Self {
        Self {
            config,
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StabilizerConfig {
        &self.config
    }

    /// Feed one raw reading for `device_id` and return the stabilized state.
    pub fn observe(&self, device_id: &str, raw: bool, now: Instant) -> bool {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let state = devices
            .entry(device_id.to_string())
            .or_insert_with(|| BluetoothDeviceState::new(now));

        let was_flapping = state.is_flapping(&self.config);
        let previous = state.reported;
        let reported = state.observe(raw, now, &self.config);

        if !was_flapping && state.is_flapping(&self.config) {
            tracing::debug!(
                device = device_id,
                changes = state.rapid_changes(),
                "bluetooth_signal_flapping"
            );
        }
        if reported != previous {
            tracing::info!(device = device_id, active = reported, "bluetooth_state_changed");
        } else if reported != raw {
            tracing::debug!(device = device_id, raw, reported, "bluetooth_reading_held");
        }

        reported
    }

    /// Last stabilized state of `device_id`, if it has been seen.
    pub fn reported_state(&self, device_id: &str) -> Option<bool> {
        self.snapshot(device_id).map(|s| s.reported)
    }

    /// Deactivation debounce currently applied to `device_id`.
    pub fn current_debounce(&self, device_id: &str) -> Option<Duration> {
        self.snapshot(device_id).map(|s| s.debounce(&self.config))
    }

    pub fn snapshot(&self, device_id: &str) -> Option<BluetoothDeviceState> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .cloned()
    }

    pub fn tracked_devices(&self) -> usize {
        self.devices.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV: &str = "bt-headset";

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn test_activation_needs_two_consecutive_checks() {
        let stabilizer = BluetoothStabilizer::default();
        let t0 = Instant::now();

        assert!(!stabilizer.observe(DEV, true, t0));
        assert!(stabilizer.observe(DEV, true, at(t0, 500)));
        for i in 2..20 {
            assert!(stabilizer.observe(DEV, true, at(t0, i * 500)));
        }
    }

    #[test]
    fn test_single_active_blip_is_not_reported() {
        let stabilizer = BluetoothStabilizer::default();
        let t0 = Instant::now();

        assert!(!stabilizer.observe(DEV, true, t0));
        assert!(!stabilizer.observe(DEV, false, at(t0, 500)));
        assert!(!stabilizer.observe(DEV, true, at(t0, 1000)));
        assert_eq!(stabilizer.reported_state(DEV), Some(false));
    }

    #[test]
    fn test_deactivation_waits_for_hold_debounce_and_checks() {
        let stabilizer = BluetoothStabilizer::default();
        let t0 = Instant::now();
        stabilizer.observe(DEV, true, t0);
        assert!(stabilizer.observe(DEV, true, at(t0, 1000)));

        // Last activity at 1.0s: the hold runs until 6.0s.
        let mut ms = 1500;
        while ms < 6000 {
            assert!(
                stabilizer.observe(DEV, false, at(t0, ms)),
                "flipped early at {ms}ms"
            );
            ms += 500;
        }
        assert!(!stabilizer.observe(DEV, false, at(t0, 6000)));
    }

    #[test]
    fn test_activity_resets_inactive_run() {
        let stabilizer = BluetoothStabilizer::default();
        let t0 = Instant::now();
        stabilizer.observe(DEV, true, t0);
        stabilizer.observe(DEV, true, at(t0, 500));

        for ms in [1000, 2000, 3000] {
            assert!(stabilizer.observe(DEV, false, at(t0, ms)));
        }
        assert!(stabilizer.observe(DEV, true, at(t0, 4000)));
        // Hold restarts from 4.0s and the inactive counter starts over.
        for ms in [5000, 6000, 7000, 8000] {
            assert!(stabilizer.observe(DEV, false, at(t0, ms)));
        }
        assert!(!stabilizer.observe(DEV, false, at(t0, 9000)));
    }

    #[test]
    fn test_flapping_extends_debounce() {
        let stabilizer = BluetoothStabilizer::default();
        let t0 = Instant::now();
        stabilizer.observe(DEV, true, t0);
        assert!(stabilizer.observe(DEV, true, at(t0, 500)));
        assert_eq!(stabilizer.current_debounce(DEV), Some(Duration::from_secs(3)));

        // Five more raw transitions: six inside ten seconds.
        for (ms, raw) in [(1000, false), (2000, true), (3000, false), (4000, true), (5000, false)] {
            assert!(stabilizer.observe(DEV, raw, at(t0, ms)));
        }
        assert_eq!(stabilizer.snapshot(DEV).unwrap().rapid_changes(), 6);
        assert_eq!(stabilizer.current_debounce(DEV), Some(Duration::from_secs(8)));

        // By 9.0s the hold (from 4.0s), a 3s debounce (from 5.0s) and four
        // inactive checks are all satisfied; only the extended debounce holds.
        for ms in [6000, 7000, 8000, 9000, 10000] {
            assert!(stabilizer.observe(DEV, false, at(t0, ms)), "flipped at {ms}ms");
        }

        let mut ms = 11000;
        while stabilizer.observe(DEV, false, at(t0, ms)) {
            ms += 1000;
            assert!(ms <= 14000, "never deactivated");
        }
    }

    #[test]
    fn test_counters_are_clamped() {
        let stabilizer = BluetoothStabilizer::default();
        let t0 = Instant::now();
        for i in 0..1000 {
            stabilizer.observe(DEV, true, at(t0, i * 100));
        }
        let state = stabilizer.snapshot(DEV).unwrap();
        assert_eq!(state.active_checks, stabilizer.config().effective_counter_cap());
        assert_eq!(state.inactive_checks, 0);
    }

    #[test]
    fn test_devices_are_tracked_independently() {
        let stabilizer = BluetoothStabilizer::default();
        let t0 = Instant::now();
        stabilizer.observe("a", true, t0);
        stabilizer.observe("a", true, at(t0, 500));
        stabilizer.observe("b", true, at(t0, 500));

        assert_eq!(stabilizer.reported_state("a"), Some(true));
        assert_eq!(stabilizer.reported_state("b"), Some(false));
        assert_eq!(stabilizer.reported_state("c"), None);
        assert_eq!(stabilizer.tracked_devices(), 2);
    }
}
