//! Device supervisor.
//!
//! Tracks a consecutive-failure count per device and the quarantine
//! window ("disabled until") it implies, so a device that's down doesn't
//! get retried every tick. Grounded on `_get_client`/`DeviceState` in
//! `original_source/main/services/poll_devices.py`; the module-level
//! `dict[str, DeviceState]` there is encapsulated into this owned struct.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::model::Id;

#[derive(Debug, Clone, Copy, Default)]
struct DeviceState {
    failures: u32,
    disabled_until: Option<DateTime<Utc>>,
}

pub struct DeviceSupervisor {
    base_backoff: Duration,
    max_backoff: Duration,
    states: RwLock<HashMap<Id, DeviceState>>,
}

impl DeviceSupervisor {
    pub fn new(base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            base_backoff,
            max_backoff,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Whether `device_id` is currently out of its quarantine window and
    /// may be polled this tick.
    pub fn is_eligible(&self, device_id: Id, now: DateTime<Utc>) -> bool {
        let states = self.states.read().unwrap();
        match states.get(&device_id) {
            Some(state) => state.disabled_until.map(|until| now >= until).unwrap_or(true),
            None => true,
        }
    }

    /// Resets the failure streak after a clean poll.
    pub fn record_success(&self, device_id: Id) {
        let mut states = self.states.write().unwrap();
        if let Some(state) = states.get_mut(&device_id) {
            if state.failures > 0 {
                info!(device_id, "device recovered, resetting backoff");
            }
            state.failures = 0;
            state.disabled_until = None;
        }
    }

    /// Increments the failure streak and (re)computes the quarantine
    /// window: `min(base * 2^(min(failures,32)-1), max)`, matching the
    /// original's `_get_client` backoff formula exactly.
    pub fn record_failure(&self, device_id: Id, now: DateTime<Utc>) {
        let mut states = self.states.write().unwrap();
        let state = states.entry(device_id).or_default();
        state.failures = state.failures.saturating_add(1);
        let exponent = state.failures.min(32).saturating_sub(1);
        let backoff_secs = (self.base_backoff.num_milliseconds() as f64 / 1000.0)
            * 2f64.powi(exponent as i32);
        let capped_secs = backoff_secs.min(self.max_backoff.num_milliseconds() as f64 / 1000.0);
        let backoff = Duration::milliseconds((capped_secs * 1000.0) as i64);
        state.disabled_until = Some(now + backoff);
        warn!(
            device_id,
            failures = state.failures,
            backoff_secs = capped_secs,
            "device poll failed, backing off"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_uses_base_backoff() {
        let supervisor = DeviceSupervisor::new(Duration::seconds(2), Duration::seconds(60));
        let now = Utc::now();
        supervisor.record_failure(1, now);
        assert!(!supervisor.is_eligible(1, now));
        assert!(supervisor.is_eligible(1, now + Duration::seconds(3)));
    }

    #[test]
    fn backoff_doubles_and_caps_at_max() {
        let supervisor = DeviceSupervisor::new(Duration::seconds(2), Duration::seconds(10));
        let now = Utc::now();
        for _ in 0..10 {
            supervisor.record_failure(1, now);
        }
        // 2 * 2^9 = 1024s, capped to 10s.
        assert!(!supervisor.is_eligible(1, now + Duration::seconds(9)));
        assert!(supervisor.is_eligible(1, now + Duration::seconds(11)));
    }

    #[test]
    fn success_clears_backoff() {
        let supervisor = DeviceSupervisor::new(Duration::seconds(2), Duration::seconds(60));
        let now = Utc::now();
        supervisor.record_failure(1, now);
        supervisor.record_success(1);
        assert!(supervisor.is_eligible(1, now));
    }
}
