//! Persistence collaborator interface.
//!
//! The real store (a relational database, in the original system) is out
//! of scope; this module defines exactly the operations the Tick
//! Scheduler needs as the sole writer, plus an `InMemoryStore` backing
//! the integration tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{PollerError, Result};
use crate::model::{
    ActivatedAlarm, AlarmConfig, AlarmSubscription, Device, Id, Tag, TagHistoryEntry, TagValue,
    TagWriteRequest, WriteOutcome,
};

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn active_devices(&self) -> Result<Vec<Device>>;
    async fn active_tags_for_device(&self, device_id: Id) -> Result<Vec<Tag>>;
    async fn pending_write_requests(&self, device_id: Id) -> Result<Vec<TagWriteRequest>>;
    async fn mark_write_processed(&self, request_id: Id, outcome: WriteOutcome) -> Result<()>;

    /// Updates `current_value`/`last_updated` for tags whose decoded
    /// value changed this tick.
    async fn update_tag_values(&self, updates: &[(Id, TagValue, DateTime<Utc>)]) -> Result<()>;
    /// Touches `last_updated` only, for tags that were read but did not
    /// change — every read tag still gets a fresh timestamp.
    async fn touch_last_updated(&self, tag_ids: &[Id], at: DateTime<Utc>) -> Result<()>;

    async fn append_history(&self, entries: &[TagHistoryEntry]) -> Result<()>;
    async fn prune_history(&self, before: DateTime<Utc>) -> Result<()>;

    async fn enabled_alarm_configs_for_tags(&self, tag_ids: &[Id]) -> Result<Vec<AlarmConfig>>;
    /// Active alarms whose config's tag is in `tag_ids`, paired with that
    /// tag id — resolved here (not by the caller) since the join holds
    /// regardless of whether the config is still enabled, mirroring
    /// `ActivatedAlarm.get_tag_map`'s `config__tag_id` lookup in
    /// `original_source/main/models.py`.
    async fn active_alarms_for_tags(&self, tag_ids: &[Id]) -> Result<Vec<(Id, ActivatedAlarm)>>;
    async fn deactivate_alarms(&self, ids: &[Id], at: DateTime<Utc>) -> Result<()>;
    /// Creates a new `ActivatedAlarm` row per winning config and returns
    /// them (with ids assigned) for the caller to build notification
    /// intents from.
    async fn activate_alarms(&self, configs: &[AlarmConfig], at: DateTime<Utc>) -> Result<Vec<ActivatedAlarm>>;
    async fn mark_alarm_notified(&self, config_id: Id, at: DateTime<Utc>) -> Result<()>;
    async fn subscriptions_for_alarm_config(&self, config_id: Id) -> Result<Vec<AlarmSubscription>>;
}

/// Test-only in-memory implementation. Not a production persistence
/// layer — no indices, no durability, `RwLock` rather than connection
/// pooling.
#[derive(Default)]
pub struct InMemoryStore {
    devices: RwLock<Vec<Device>>,
    tags: RwLock<HashMap<Id, Tag>>,
    write_requests: RwLock<Vec<TagWriteRequest>>,
    history: RwLock<Vec<TagHistoryEntry>>,
    alarm_configs: RwLock<HashMap<Id, AlarmConfig>>,
    activated_alarms: RwLock<Vec<ActivatedAlarm>>,
    subscriptions: RwLock<Vec<AlarmSubscription>>,
    next_alarm_row_id: RwLock<Id>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_device(&self, device: Device) {
        self.devices.write().unwrap().push(device);
    }

    pub fn insert_tag(&self, tag: Tag) {
        self.tags.write().unwrap().insert(tag.id, tag);
    }

    pub fn insert_write_request(&self, request: TagWriteRequest) {
        self.write_requests.write().unwrap().push(request);
    }

    pub fn insert_alarm_config(&self, config: AlarmConfig) {
        self.alarm_configs.write().unwrap().insert(config.id, config);
    }

    pub fn insert_subscription(&self, subscription: AlarmSubscription) {
        self.subscriptions.write().unwrap().push(subscription);
    }

    pub fn tag(&self, tag_id: Id) -> Option<Tag> {
        self.tags.read().unwrap().get(&tag_id).cloned()
    }

    pub fn history_len(&self) -> usize {
        self.history.read().unwrap().len()
    }

    pub fn active_alarms_snapshot(&self) -> Vec<ActivatedAlarm> {
        self.activated_alarms.read().unwrap().clone()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn active_devices(&self) -> Result<Vec<Device>> {
        Ok(self
            .devices
            .read()
            .unwrap()
            .iter()
            .filter(|d| d.is_active)
            .cloned()
            .collect())
    }

    async fn active_tags_for_device(&self, device_id: Id) -> Result<Vec<Tag>> {
        Ok(self
            .tags
            .read()
            .unwrap()
            .values()
            .filter(|t| t.device_id == device_id && t.is_active)
            .cloned()
            .collect())
    }

    async fn pending_write_requests(&self, device_id: Id) -> Result<Vec<TagWriteRequest>> {
        let tags = self.tags.read().unwrap();
        Ok(self
            .write_requests
            .read()
            .unwrap()
            .iter()
            .filter(|r| {
                !r.processed
                    && tags
                        .get(&r.tag_id)
                        .map(|t| t.device_id == device_id)
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn mark_write_processed(&self, request_id: Id, outcome: WriteOutcome) -> Result<()> {
        let mut requests = self.write_requests.write().unwrap();
        let req = requests
            .iter_mut()
            .find(|r| r.id == request_id)
            .ok_or(PollerError::Persistence {
                reason: format!("write request {request_id} not found"),
            })?;
        // Both variants are terminal dispositions — a transport fault
        // never reaches here, since write_queue::drain_writes propagates
        // it instead of producing a WriteOutcome, leaving `processed`
        // untouched for retry.
        match outcome {
            WriteOutcome::Accepted | WriteOutcome::Rejected(_) => req.processed = true,
        }
        Ok(())
    }

    async fn update_tag_values(&self, updates: &[(Id, TagValue, DateTime<Utc>)]) -> Result<()> {
        let mut tags = self.tags.write().unwrap();
        for (tag_id, value, at) in updates {
            if let Some(tag) = tags.get_mut(tag_id) {
                tag.current_value = Some(value.clone());
                tag.last_updated = Some(*at);
            }
        }
        Ok(())
    }

    async fn touch_last_updated(&self, tag_ids: &[Id], at: DateTime<Utc>) -> Result<()> {
        let mut tags = self.tags.write().unwrap();
        for tag_id in tag_ids {
            if let Some(tag) = tags.get_mut(tag_id) {
                tag.last_updated = Some(at);
            }
        }
        Ok(())
    }

    async fn append_history(&self, entries: &[TagHistoryEntry]) -> Result<()> {
        self.history.write().unwrap().extend_from_slice(entries);
        let mut tags = self.tags.write().unwrap();
        for entry in entries {
            if let Some(tag) = tags.get_mut(&entry.tag_id) {
                tag.last_history_at = Some(entry.timestamp);
            }
        }
        Ok(())
    }

    async fn prune_history(&self, before: DateTime<Utc>) -> Result<()> {
        self.history.write().unwrap().retain(|e| e.timestamp >= before);
        Ok(())
    }

    async fn enabled_alarm_configs_for_tags(&self, tag_ids: &[Id]) -> Result<Vec<AlarmConfig>> {
        Ok(self
            .alarm_configs
            .read()
            .unwrap()
            .values()
            .filter(|c| c.enabled && tag_ids.contains(&c.tag_id))
            .cloned()
            .collect())
    }

    async fn active_alarms_for_tags(&self, tag_ids: &[Id]) -> Result<Vec<(Id, ActivatedAlarm)>> {
        let configs = self.alarm_configs.read().unwrap();
        Ok(self
            .activated_alarms
            .read()
            .unwrap()
            .iter()
            .filter(|a| a.is_active)
            .filter_map(|a| {
                let tag_id = configs.get(&a.config_id)?.tag_id;
                tag_ids.contains(&tag_id).then(|| (tag_id, a.clone()))
            })
            .collect())
    }

    async fn deactivate_alarms(&self, ids: &[Id], at: DateTime<Utc>) -> Result<()> {
        let mut alarms = self.activated_alarms.write().unwrap();
        for alarm in alarms.iter_mut() {
            if ids.contains(&alarm.id) {
                alarm.is_active = false;
                alarm.resolved_at = Some(at);
            }
        }
        Ok(())
    }

    async fn activate_alarms(&self, configs: &[AlarmConfig], at: DateTime<Utc>) -> Result<Vec<ActivatedAlarm>> {
        let mut alarms = self.activated_alarms.write().unwrap();
        let mut next_id = self.next_alarm_row_id.write().unwrap();
        let mut created = Vec::with_capacity(configs.len());
        for config in configs {
            *next_id += 1;
            let row = ActivatedAlarm {
                id: *next_id,
                config_id: config.id,
                timestamp: at,
                is_active: true,
                resolved_at: None,
                acknowledged: false,
                acknowledged_at: None,
                acknowledged_by: None,
            };
            alarms.push(row.clone());
            created.push(row);
        }
        Ok(created)
    }

    async fn mark_alarm_notified(&self, config_id: Id, at: DateTime<Utc>) -> Result<()> {
        let mut configs = self.alarm_configs.write().unwrap();
        if let Some(config) = configs.get_mut(&config_id) {
            config.last_notified = Some(at);
        }
        Ok(())
    }

    async fn subscriptions_for_alarm_config(&self, config_id: Id) -> Result<Vec<AlarmSubscription>> {
        Ok(self
            .subscriptions
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.alarm_config_id == config_id)
            .cloned()
            .collect())
    }
}
