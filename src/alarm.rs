//! Alarm evaluator.
//!
//! Per-tag priority arbitration: at most one `ActivatedAlarm` is active
//! per tag at a time, and a winner change deactivates the old row before
//! activating the new one. Grounded on `AlarmConfig.update_alarms` in
//! `original_source/main/models.py`.

use std::collections::HashMap;

use crate::model::{ActivatedAlarm, AlarmConfig, Id, TagValue};

pub struct AlarmDecision {
    /// `ActivatedAlarm` row ids to mark resolved.
    pub deactivate: Vec<Id>,
    /// Configs that just became the winning alarm for their tag; the
    /// caller creates one new `ActivatedAlarm` row per entry.
    pub activate: Vec<AlarmConfig>,
}

/// Arbitrates `configs` against `tag_values`, given the currently active
/// alarm (if any) per tag in `active_alarms`. `configs` should already be
/// filtered to `enabled == true`; `active_alarms` pairs each
/// `is_active == true` row with its already-resolved tag id (see
/// `PersistenceStore::active_alarms_for_tags`), so a stale active alarm
/// whose config has since been disabled still gets cleared correctly.
pub fn evaluate(
    tag_values: &HashMap<Id, TagValue>,
    configs: &[AlarmConfig],
    active_alarms: &[(Id, ActivatedAlarm)],
) -> AlarmDecision {
    let mut configs_by_tag: HashMap<Id, Vec<&AlarmConfig>> = HashMap::new();
    for config in configs {
        configs_by_tag.entry(config.tag_id).or_default().push(config);
    }

    let active_by_tag: HashMap<Id, &ActivatedAlarm> =
        active_alarms.iter().map(|(tag_id, alarm)| (*tag_id, alarm)).collect();

    let mut decision = AlarmDecision {
        deactivate: Vec::new(),
        activate: Vec::new(),
    };

    let tags: std::collections::HashSet<Id> = configs_by_tag
        .keys()
        .copied()
        .chain(active_by_tag.keys().copied())
        .collect();

    for tag_id in tags {
        let Some(value) = tag_values.get(&tag_id) else { continue };
        let empty = Vec::new();
        let candidates = configs_by_tag.get(&tag_id).unwrap_or(&empty);

        let winning = candidates
            .iter()
            .filter(|c| c.is_activation(value))
            .max_by_key(|c| c.threat_level.priority());

        let current = active_by_tag.get(&tag_id);

        if let Some(cur) = current {
            let still_winning = winning.map(|w| w.id) == Some(cur.config_id);
            if !still_winning {
                decision.deactivate.push(cur.id);
            }
        }
        if let Some(win) = winning {
            let already_active = current.map(|c| c.config_id) == Some(win.id);
            if !already_active {
                decision.activate.push((*win).clone());
            }
        }
    }

    decision
}

/// Whether `config` is eligible to fire a notification right now, i.e.
/// its cooldown window has elapsed. Mirrors `ActivatedAlarm.should_notify`.
pub fn should_notify(config: &AlarmConfig, now: chrono::DateTime<chrono::Utc>) -> bool {
    match config.last_notified {
        None => true,
        Some(last) => now - last > config.notification_cooldown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlarmOperator, ThreatLevel};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn cfg(id: Id, tag_id: Id, level: ThreatLevel, threshold: f64) -> AlarmConfig {
        AlarmConfig {
            id,
            external_id: Uuid::nil(),
            tag_id,
            operator: AlarmOperator::GreaterThan,
            trigger_value: TagValue::Float(threshold),
            threat_level: level,
            message: "over threshold".into(),
            enabled: true,
            notification_cooldown: Duration::minutes(1),
            last_notified: None,
        }
    }

    #[test]
    fn higher_priority_config_wins_when_both_trigger() {
        let low = cfg(1, 1, ThreatLevel::Low, 10.0);
        let high = cfg(2, 1, ThreatLevel::High, 20.0);
        let mut values = HashMap::new();
        values.insert(1, TagValue::Float(50.0));
        let decision = evaluate(&values, &[low, high], &[]);
        assert_eq!(decision.activate.len(), 1);
        assert_eq!(decision.activate[0].id, 2);
    }

    #[test]
    fn winner_change_deactivates_then_activates() {
        let low = cfg(1, 1, ThreatLevel::Low, 10.0);
        let high = cfg(2, 1, ThreatLevel::High, 20.0);
        let active = ActivatedAlarm {
            id: 100,
            config_id: 1,
            timestamp: Utc::now(),
            is_active: true,
            resolved_at: None,
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
        };
        let mut values = HashMap::new();
        values.insert(1, TagValue::Float(50.0));
        let decision = evaluate(&values, &[low, high], &[(1, active)]);
        assert_eq!(decision.deactivate, vec![100]);
        assert_eq!(decision.activate[0].id, 2);
    }

    #[test]
    fn no_longer_triggering_clears_active_alarm() {
        let low = cfg(1, 1, ThreatLevel::Low, 10.0);
        let active = ActivatedAlarm {
            id: 100,
            config_id: 1,
            timestamp: Utc::now(),
            is_active: true,
            resolved_at: None,
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
        };
        let mut values = HashMap::new();
        values.insert(1, TagValue::Float(1.0));
        let decision = evaluate(&values, &[low], &[(1, active)]);
        assert_eq!(decision.deactivate, vec![100]);
        assert!(decision.activate.is_empty());
    }

    #[test]
    fn cooldown_blocks_repeat_notification() {
        let mut c = cfg(1, 1, ThreatLevel::Low, 10.0);
        c.last_notified = Some(Utc::now());
        assert!(!should_notify(&c, Utc::now()));
    }
}
