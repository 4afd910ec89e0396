//! History sampler.
//!
//! Decides which read tags get a `TagHistoryEntry` this tick (on-change,
//! interval-gated) and paces the retention prune so it isn't run every
//! single tick. Grounded on `Tag.bulk_create_history` in
//! `original_source/main/models.py`.

use chrono::{DateTime, Duration, Utc};

use crate::model::{Tag, TagHistoryEntry, TagValue};

/// Whether `tag` should get a new history row right now. Requires both
/// that its value changed this tick and that the interval gate has
/// elapsed — stricter than sampling on every read regardless of change.
pub fn should_sample(tag: &Tag, changed: bool, now: DateTime<Utc>) -> bool {
    if !changed {
        return false;
    }
    if tag.history_retention <= Duration::zero() {
        return false;
    }
    match tag.last_history_at {
        None => true,
        Some(last) => now - last >= tag.history_interval,
    }
}

pub fn make_entry(tag: &Tag, value: TagValue, now: DateTime<Utc>) -> TagHistoryEntry {
    TagHistoryEntry {
        tag_id: tag.id,
        timestamp: now,
        value: Some(value),
    }
}

/// Paces history retention pruning so it runs once every N ticks rather
/// than every tick.
pub struct PruneSchedule {
    every_n_ticks: u32,
    tick: u32,
}

impl PruneSchedule {
    pub fn new(every_n_ticks: u32) -> Self {
        Self {
            every_n_ticks: every_n_ticks.max(1),
            tick: 0,
        }
    }

    /// Call once per tick; returns `true` on ticks where pruning should run.
    pub fn advance(&mut self) -> bool {
        self.tick += 1;
        let due = self.tick % self.every_n_ticks == 0;
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn tag(retention: Duration, interval: Duration, last_history_at: Option<DateTime<Utc>>) -> Tag {
        Tag {
            id: 1,
            external_id: Uuid::nil(),
            device_id: 1,
            unit_id: 1,
            channel: crate::model::Channel::HoldingRegister,
            data_type: crate::model::DataType::UInt16,
            address: 0,
            bit_index: 0,
            read_amount: 1,
            restricted_write: false,
            history_interval: interval,
            history_retention: retention,
            current_value: None,
            last_updated: None,
            last_history_at,
            is_active: true,
        }
    }

    #[test]
    fn zero_retention_disables_sampling() {
        let t = tag(Duration::zero(), Duration::seconds(1), None);
        assert!(!should_sample(&t, true, Utc::now()));
    }

    #[test]
    fn unchanged_value_never_sampled() {
        let t = tag(Duration::days(1), Duration::seconds(1), None);
        assert!(!should_sample(&t, false, Utc::now()));
    }

    #[test]
    fn first_sample_always_taken_when_changed() {
        let t = tag(Duration::days(1), Duration::seconds(1), None);
        assert!(should_sample(&t, true, Utc::now()));
    }

    #[test]
    fn interval_gates_subsequent_samples() {
        let now = Utc::now();
        let t = tag(Duration::days(1), Duration::seconds(60), Some(now));
        assert!(!should_sample(&t, true, now + Duration::seconds(1)));
        assert!(should_sample(&t, true, now + Duration::seconds(61)));
    }

    #[test]
    fn prune_schedule_fires_every_n_ticks() {
        let mut schedule = PruneSchedule::new(3);
        assert!(!schedule.advance());
        assert!(!schedule.advance());
        assert!(schedule.advance());
        assert!(!schedule.advance());
    }
}
