//! Notification intents.
//!
//! The alarm evaluator emits one `NotificationIntent` per newly-activated
//! alarm onto a bounded channel; delivery (email/SMS) is an external
//! collaborator's job, out of scope here. `AlarmSubscription` rows are
//! consulted here only to populate `recipients`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::model::{AlarmConfig, AlarmSubscription, Id, TagValue, ThreatLevel};

#[derive(Debug, Clone, Serialize)]
pub struct NotificationRecipient {
    pub user_id: Id,
    pub email: bool,
    pub sms: bool,
}

/// Wire-facing payload to the notification collaborator. Identifies the
/// config and tag by their stable `external_id`s rather than internal
/// row ids, since an external consumer only ever has the former.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationIntent {
    pub config_external_id: Uuid,
    pub tag_external_id: Uuid,
    pub threat_level: ThreatLevel,
    pub message: String,
    pub trigger_value: TagValue,
    pub observed_value: TagValue,
    pub timestamp: DateTime<Utc>,
    pub recipients: Vec<NotificationRecipient>,
}

pub fn build_intent(
    config: &AlarmConfig,
    tag_external_id: Uuid,
    observed_value: TagValue,
    subscriptions: &[AlarmSubscription],
    at: DateTime<Utc>,
) -> NotificationIntent {
    NotificationIntent {
        config_external_id: config.external_id,
        tag_external_id,
        threat_level: config.threat_level,
        message: config.message.clone(),
        trigger_value: config.trigger_value.clone(),
        observed_value,
        timestamp: at,
        recipients: subscriptions
            .iter()
            .map(|s| NotificationRecipient {
                user_id: s.user_id,
                email: s.email_enabled,
                sms: s.sms_enabled,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn recipients_carry_per_channel_flags() {
        let config = AlarmConfig {
            id: 1,
            external_id: Uuid::nil(),
            tag_id: 1,
            operator: crate::model::AlarmOperator::GreaterThan,
            trigger_value: TagValue::Float(10.0),
            threat_level: ThreatLevel::High,
            message: "hot".into(),
            enabled: true,
            notification_cooldown: chrono::Duration::minutes(1),
            last_notified: None,
        };
        let subs = vec![AlarmSubscription {
            id: 1,
            user_id: 42,
            alarm_config_id: 1,
            email_enabled: true,
            sms_enabled: false,
        }];
        let tag_external_id = Uuid::new_v4();
        let intent = build_intent(&config, tag_external_id, TagValue::Float(99.0), &subs, Utc::now());
        assert_eq!(intent.tag_external_id, tag_external_id);
        assert_eq!(intent.config_external_id, config.external_id);
        assert_eq!(intent.recipients.len(), 1);
        assert!(intent.recipients[0].email);
        assert!(!intent.recipients[0].sms);
    }
}
