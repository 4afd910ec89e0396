//! Tick scheduler.
//!
//! `PollerEngine` owns the supervisor, the per-device transport map, the
//! subscriber registry, and a handle to the persistence collaborator; it
//! replaces the module-level globals (`clients`, `device_states`) in
//! `original_source/main/services/poll_devices.py` with a single owned
//! struct. `run_tick` is the sole structured-concurrency boundary:
//! per-device futures are joined before alarm evaluation, persistence,
//! and fan-out commit.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::alarm;
use crate::block::{self, ReadBlock};
use crate::config::PollerConfig;
use crate::error::Result;
use crate::evaluator::{self, ReadTagResult};
use crate::fanout::{SubscriberRegistry, TagUpdate, TickChangeMessage};
use crate::history::{self, PruneSchedule};
use crate::model::{Device, Id, Protocol, Tag, TagHistoryEntry, TagValue, WriteOutcome};
use crate::notify::{self, NotificationIntent};
use crate::persistence::PersistenceStore;
use crate::supervisor::DeviceSupervisor;
use crate::transport::tcp::{TcpConfig, TcpTransport};
use crate::transport::udp::{UdpConfig, UdpTransport};
use crate::transport::Transport;
use crate::write_queue;

struct DeviceTickOutcome {
    read_results: Vec<ReadTagResult>,
    history_entries: Vec<TagHistoryEntry>,
    write_outcomes: Vec<(Id, WriteOutcome)>,
}

pub struct PollerEngine {
    config: PollerConfig,
    store: Arc<dyn PersistenceStore>,
    registry: Arc<SubscriberRegistry>,
    supervisor: DeviceSupervisor,
    transports: RwLock<HashMap<Id, Arc<dyn Transport>>>,
    notify_tx: mpsc::Sender<NotificationIntent>,
    prune_schedule: tokio::sync::Mutex<PruneSchedule>,
}

impl PollerEngine {
    pub fn new(
        config: PollerConfig,
        store: Arc<dyn PersistenceStore>,
        registry: Arc<SubscriberRegistry>,
    ) -> (Self, mpsc::Receiver<NotificationIntent>) {
        let (notify_tx, notify_rx) = mpsc::channel(256);
        let supervisor = DeviceSupervisor::new(config.connect_backoff_base(), config.connect_backoff_max());
        let prune_schedule = tokio::sync::Mutex::new(PruneSchedule::new(config.history_prune_every_n_ticks));
        let engine = Self {
            config,
            store,
            registry,
            supervisor,
            transports: RwLock::new(HashMap::new()),
            notify_tx,
            prune_schedule,
        };
        (engine, notify_rx)
    }

    /// Runs `run_tick` forever, sleeping off whatever's left of the
    /// configured poll interval after each tick — the same
    /// `sleep(max(0, poll_interval - elapsed))` pacing as the original
    /// `poll_devices` loop.
    pub async fn run(&self) {
        loop {
            let started = tokio::time::Instant::now();
            if let Err(e) = self.run_tick().await {
                warn!(error = %e, "tick failed");
            }
            let elapsed = started.elapsed();
            let interval = self.config.poll_interval();
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            }
        }
    }

    pub async fn run_tick(&self) -> Result<()> {
        let tick_start = Utc::now();
        let devices = self.store.active_devices().await?;
        let pollable: Vec<Device> = devices
            .into_iter()
            .filter(|d| d.protocol != Protocol::Rtu && self.supervisor.is_eligible(d.id, tick_start))
            .collect();

        let max_concurrent = self.config.max_concurrent_devices.min(pollable.len().max(1));
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let mut join_set = JoinSet::new();

        for device in pollable {
            let transport = self.transport_for(&device);
            let store = self.store.clone();
            let semaphore = semaphore.clone();
            let block_max_gap = self.config.block_max_gap;
            let block_max_size = self.config.block_max_size;

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.unwrap();
                let outcome = poll_one_device(
                    &device,
                    store.as_ref(),
                    transport.as_ref(),
                    block_max_gap,
                    block_max_size,
                    tick_start,
                )
                .await;
                (device.id, outcome, transport)
            });
        }

        let mut tag_value_updates: Vec<(Id, TagValue, DateTime<Utc>)> = Vec::new();
        let mut touched_tag_ids: Vec<Id> = Vec::new();
        let mut history_entries: Vec<TagHistoryEntry> = Vec::new();
        let mut current_values: HashMap<Id, TagValue> = HashMap::new();
        let mut tag_external_ids: HashMap<Id, uuid::Uuid> = HashMap::new();
        let mut changed_tag_ids: Vec<Id> = Vec::new();

        while let Some(joined) = join_set.join_next().await {
            let (device_id, outcome, transport) = match joined {
                Ok(triple) => triple,
                Err(e) => {
                    warn!(error = %e, "device poll task panicked");
                    continue;
                }
            };
            match outcome {
                Ok(device_outcome) => {
                    self.supervisor.record_success(device_id);
                    for result in device_outcome.read_results {
                        current_values.insert(result.tag_id, result.value.clone());
                        tag_external_ids.insert(result.tag_id, result.tag_external_id);
                        if result.changed {
                            tag_value_updates.push((result.tag_id, result.value, tick_start));
                            changed_tag_ids.push(result.tag_id);
                        } else {
                            touched_tag_ids.push(result.tag_id);
                        }
                    }
                    history_entries.extend(device_outcome.history_entries);
                    for (request_id, write_outcome) in device_outcome.write_outcomes {
                        self.store.mark_write_processed(request_id, write_outcome).await?;
                    }
                }
                Err(e) => {
                    warn!(device_id, error = %e, "device poll failed");
                    // A ProtocolError/CodecError leaves the connection
                    // healthy — no backoff, no reconnect. Only a transport
                    // fault counts against the device's eligibility and
                    // tears down the (now presumably broken) connection so
                    // the next tick reconnects from scratch.
                    if e.is_recoverable() {
                        self.supervisor.record_failure(device_id, tick_start);
                        transport.disconnect().await;
                        self.transports.write().unwrap().remove(&device_id);
                    }
                }
            }
        }

        self.store.update_tag_values(&tag_value_updates).await?;
        self.store.touch_last_updated(&touched_tag_ids, tick_start).await?;
        if !history_entries.is_empty() {
            self.store.append_history(&history_entries).await?;
        }

        let alarm_by_tag = self
            .evaluate_alarms(&current_values, &tag_external_ids, tick_start)
            .await?;

        if !changed_tag_ids.is_empty() {
            let mut changes = TickChangeMessage::new();
            for tag_id in &changed_tag_ids {
                if let Some(value) = current_values.get(tag_id) {
                    changes.insert(
                        *tag_id,
                        TagUpdate {
                            value: value.clone(),
                            time: tick_start,
                            age_ms: 0,
                            alarm: alarm_by_tag.get(tag_id).copied(),
                        },
                    );
                }
            }
            self.registry.broadcast(&changes);
        }

        if self.prune_schedule.lock().await.advance() {
            let cutoff = tick_start - chrono::Duration::days(30);
            self.store.prune_history(cutoff).await?;
        }

        Ok(())
    }

    /// Arbitrates alarms for every tag read this tick and emits
    /// notification intents for newly-activated ones that clear their
    /// cooldown. Returns the winning threat level per tag for the
    /// fan-out payload.
    async fn evaluate_alarms(
        &self,
        current_values: &HashMap<Id, TagValue>,
        tag_external_ids: &HashMap<Id, uuid::Uuid>,
        now: DateTime<Utc>,
    ) -> Result<HashMap<Id, crate::model::ThreatLevel>> {
        if current_values.is_empty() {
            return Ok(HashMap::new());
        }
        let tag_ids: Vec<Id> = current_values.keys().copied().collect();
        let configs = self.store.enabled_alarm_configs_for_tags(&tag_ids).await?;
        let active = self.store.active_alarms_for_tags(&tag_ids).await?;

        let decision = alarm::evaluate(current_values, &configs, &active);

        if !decision.deactivate.is_empty() {
            self.store.deactivate_alarms(&decision.deactivate, now).await?;
        }

        let mut winners = HashMap::new();
        for config in &configs {
            if let Some(value) = current_values.get(&config.tag_id) {
                if config.is_activation(value) {
                    winners
                        .entry(config.tag_id)
                        .and_modify(|level: &mut crate::model::ThreatLevel| {
                            if config.threat_level > *level {
                                *level = config.threat_level;
                            }
                        })
                        .or_insert(config.threat_level);
                }
            }
        }

        if !decision.activate.is_empty() {
            let activated = self.store.activate_alarms(&decision.activate, now).await?;
            for (config, _row) in decision.activate.iter().zip(activated.iter()) {
                if !alarm::should_notify(config, now) {
                    continue;
                }
                let Some(value) = current_values.get(&config.tag_id) else { continue };
                let Some(&tag_external_id) = tag_external_ids.get(&config.tag_id) else { continue };
                let subscriptions = self.store.subscriptions_for_alarm_config(config.id).await?;
                let intent = notify::build_intent(config, tag_external_id, value.clone(), &subscriptions, now);
                if self.notify_tx.try_send(intent).is_err() {
                    warn!(config_id = config.id, "notification channel full, dropping intent");
                }
                self.store.mark_alarm_notified(config.id, now).await?;
            }
        }

        Ok(winners)
    }

    fn transport_for(&self, device: &Device) -> Arc<dyn Transport> {
        if let Some(existing) = self.transports.read().unwrap().get(&device.id) {
            return existing.clone();
        }
        let remote_addr = SocketAddr::new(device.host, device.port);
        let transport: Arc<dyn Transport> = match device.protocol {
            Protocol::Tcp => Arc::new(TcpTransport::new(
                device.alias.clone(),
                TcpConfig {
                    remote_addr,
                    connect_timeout: self.config.op_timeout(),
                    op_timeout: self.config.op_timeout(),
                },
            )),
            Protocol::Udp => Arc::new(UdpTransport::new(
                device.alias.clone(),
                UdpConfig {
                    remote_addr,
                    op_timeout: self.config.op_timeout(),
                },
            )),
            Protocol::Rtu => unreachable!("RTU devices are filtered out before this point"),
        };
        self.transports.write().unwrap().insert(device.id, transport.clone());
        transport
    }
}

async fn poll_one_device(
    device: &Device,
    store: &dyn PersistenceStore,
    transport: &dyn Transport,
    block_max_gap: u16,
    block_max_size: u16,
    now: DateTime<Utc>,
) -> Result<DeviceTickOutcome> {
    transport.connect().await?;

    let tags = store.active_tags_for_device(device.id).await?;
    let tag_map: HashMap<Id, Tag> = tags.iter().map(|t| (t.id, t.clone())).collect();

    let write_requests = store.pending_write_requests(device.id).await?;
    let write_outcomes = write_queue::drain_writes(transport, &tag_map, &write_requests).await?;

    let tag_refs: Vec<&Tag> = tags.iter().collect();
    let blocks: Vec<ReadBlock> = block::plan_blocks(&tag_refs, block_max_gap, block_max_size);

    let mut read_results = Vec::new();
    let mut history_entries = Vec::new();
    for read_block in &blocks {
        // A ProtocolError on one block (malformed response, bad function
        // code) must not drop every other block's results for this
        // device/tick — only a transport fault aborts the whole device.
        let block_results = match evaluator::read_block(transport, device.word_order, read_block, &tag_map).await {
            Ok(results) => results,
            Err(e) if e.is_recoverable() => return Err(e),
            Err(e) => {
                warn!(device = %device.alias, error = %e, "block read failed, skipping block");
                continue;
            }
        };
        for result in block_results {
            if let Some(tag) = tag_map.get(&result.tag_id) {
                if history::should_sample(tag, result.changed, now) {
                    history_entries.push(history::make_entry(tag, result.value.clone(), now));
                }
            }
            read_results.push(result);
        }
    }

    info!(
        device = %device.alias,
        blocks = blocks.len(),
        tags = read_results.len(),
        "device poll complete"
    );

    Ok(DeviceTickOutcome {
        read_results,
        history_entries,
        write_outcomes,
    })
}
