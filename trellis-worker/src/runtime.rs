//! Worker runtime: the protocol half of a connector instance.
//!
//! Owns the instance topic space and implements the wire contract on top of
//! any [`BusClient`]: presence announcements, command handling (staleness,
//! deduplication, normalization, bounded execution), retained state
//! snapshots with per-property fan-out, localized device errors.

use parking_lot::Mutex;
use rumqttc::QoS;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use trellis_bus::{
    publish_json, BusClient, Channel, CmdResponse, Command, ErrorMessage, NormalizerSet, Presence,
    Severity, StateUpdate, TopicSpace,
};

use crate::config::{DeviceEntry, WorkerConfig};
use crate::connector::Connector;
use crate::error::WorkerError;

/// Default execution timeout when a command does not carry one.
const DEFAULT_CMD_TIMEOUT_SECS: u64 = 10;
/// Responses kept for duplicate-delivery replay.
const RESPONSE_CACHE_SIZE: usize = 256;

pub struct WorkerRuntime {
    topics: TopicSpace,
    config: WorkerConfig,
    connector: Box<dyn Connector>,
    normalizers: NormalizerSet,
    /// Last known state per device, feeds normalizers and parasite reads.
    state_cache: Mutex<HashMap<String, Value>>,
    /// Command id -> response already sent, for at-least-once redeliveries.
    seen: Mutex<ResponseCache>,
}

struct ResponseCache {
    by_id: HashMap<String, CmdResponse>,
    order: VecDeque<String>,
}

impl ResponseCache {
    fn new() -> Self {
        Self { by_id: HashMap::new(), order: VecDeque::new() }
    }

    fn get(&self, id: &str) -> Option<CmdResponse> {
        self.by_id.get(id).cloned()
    }

    fn insert(&mut self, id: String, response: CmdResponse) {
        if self.by_id.insert(id.clone(), response).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > RESPONSE_CACHE_SIZE {
            if let Some(evicted) = self.order.pop_front() {
                self.by_id.remove(&evicted);
            }
        }
    }
}

impl WorkerRuntime {
    pub fn new(config: WorkerConfig, connector: Box<dyn Connector>) -> Self {
        let topics = TopicSpace::new(&config.base_topic, &config.instance_id);
        let normalizers = connector.normalizers();
        Self {
            topics,
            config,
            connector,
            normalizers,
            state_cache: Mutex::new(HashMap::new()),
            seen: Mutex::new(ResponseCache::new()),
        }
    }

    pub fn topics(&self) -> &TopicSpace {
        &self.topics
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn connector(&self) -> &dyn Connector {
        self.connector.as_ref()
    }

    fn device(&self, device_id: &str) -> Option<&DeviceEntry> {
        self.config.instance.devices.iter().find(|d| d.device_id == device_id)
    }

    /// Announces presence and subscribes to the command namespace. The
    /// last-will carrying `offline` must already be registered in the
    /// connection options (see `trellis_bus::presence::mqtt_options`).
    pub async fn announce_online(&self, bus: &dyn BusClient) -> Result<(), WorkerError> {
        bus.subscribe(&self.topics.cmd_subscription(), QoS::AtLeastOnce).await?;
        bus.publish(
            &self.topics.status(),
            QoS::AtLeastOnce,
            true,
            Presence::Online.as_str().as_bytes().to_vec(),
        )
        .await?;
        info!("instance {} online", self.config.instance_id);
        Ok(())
    }

    /// Graceful shutdown: explicit retained `offline`, then connector
    /// teardown. Never relies on the last-will, which the broker may delay
    /// by a full keepalive window.
    pub async fn shutdown(&self, bus: &dyn BusClient) -> Result<(), WorkerError> {
        bus.publish(
            &self.topics.status(),
            QoS::AtLeastOnce,
            true,
            Presence::Offline.as_str().as_bytes().to_vec(),
        )
        .await?;
        self.connector.stop().await?;
        info!("instance {} offline", self.config.instance_id);
        Ok(())
    }

    /// Polls every enabled device and publishes retained snapshots. A
    /// failing device yields a device-scoped error and does not disturb
    /// its siblings.
    pub async fn poll_cycle(&self, bus: &dyn BusClient) -> Result<(), WorkerError> {
        let devices: Vec<DeviceEntry> = self
            .config
            .instance
            .devices
            .iter()
            .filter(|d| d.enabled)
            .cloned()
            .collect();

        for device in devices {
            match self.connector.poll_device(&device).await {
                Ok(snapshot) => {
                    let mut update = StateUpdate::new(&device.device_id, snapshot.state);
                    update.link_quality = snapshot.link_quality;
                    self.publish_state(bus, &device.device_id, update).await?;
                }
                Err(e) => {
                    warn!("poll failed for {}: {e}", device.device_id);
                    self.publish_device_error(bus, &device.device_id, &e).await?;
                }
            }
        }
        Ok(())
    }

    /// Handles one raw payload received on a device cmd topic.
    pub async fn handle_command(
        &self,
        bus: &dyn BusClient,
        device_id: &str,
        payload: &[u8],
    ) -> Result<(), WorkerError> {
        let cmd: Command = match serde_json::from_slice(payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("malformed command on {device_id}: {e}");
                let err = WorkerError::Command(format!("malformed command payload: {e}"));
                return self.publish_device_error(bus, device_id, &err).await;
            }
        };

        // Stale commands are dropped with no response and no state change:
        // at-least-once redelivery after a broker outage must not replay
        // hours-old instructions onto live devices.
        let now = OffsetDateTime::now_utc();
        if cmd.is_stale(self.config.staleness.try_into().unwrap_or(time::Duration::seconds(30)), now)
        {
            debug!("dropping stale command {} on {device_id}", cmd.id);
            return Ok(());
        }

        // Duplicate delivery: replay the recorded response, never re-execute.
        let cached = self.seen.lock().get(&cmd.id);
        if let Some(response) = cached {
            debug!("duplicate command {}, replaying response", cmd.id);
            return self.publish_response(bus, device_id, &response).await;
        }

        let Some(device) = self.device(device_id).cloned() else {
            let err = WorkerError::Command(format!("unknown device '{device_id}'"));
            let response = CmdResponse::error(&cmd.id, err.to_string());
            self.remember(&cmd.id, &response);
            self.publish_response(bus, device_id, &response).await?;
            return self.publish_device_error(bus, device_id, &err).await;
        };

        let values = self.normalize_values(device_id, &cmd.values);
        let timeout = std::time::Duration::from_secs(
            cmd.timeout_seconds.unwrap_or(DEFAULT_CMD_TIMEOUT_SECS),
        );

        let outcome =
            tokio::time::timeout(timeout, self.connector.handle_command(&device, &values)).await;

        let response = match outcome {
            Ok(Ok(state)) => {
                let mut update = StateUpdate::new(device_id, state.clone());
                update.link_quality = None;
                let response = CmdResponse::success(&cmd.id, state);
                self.remember(&cmd.id, &response);
                self.publish_response(bus, device_id, &response).await?;
                self.publish_state(bus, device_id, update).await?;
                return Ok(());
            }
            Ok(Err(e)) => {
                self.publish_device_error(bus, device_id, &e).await?;
                CmdResponse::error(&cmd.id, e.to_string())
            }
            Err(_) => {
                warn!("command {} timed out after {timeout:?}", cmd.id);
                CmdResponse::timeout(&cmd.id)
            }
        };
        self.remember(&cmd.id, &response);
        self.publish_response(bus, device_id, &response).await
    }

    /// Runs incoming values through the connector's normalizer chain,
    /// feeding each one the cached current value of its property.
    fn normalize_values(&self, device_id: &str, values: &Map<String, Value>) -> Map<String, Value> {
        let cache = self.state_cache.lock();
        let current_state = cache.get(device_id);
        values
            .iter()
            .map(|(property, incoming)| {
                let current = current_state.and_then(|s| s.get(property));
                (property.clone(), self.normalizers.apply(property, incoming, current))
            })
            .collect()
    }

    fn remember(&self, cmd_id: &str, response: &CmdResponse) {
        self.seen.lock().insert(cmd_id.to_string(), response.clone());
    }

    async fn publish_response(
        &self,
        bus: &dyn BusClient,
        device_id: &str,
        response: &CmdResponse,
    ) -> Result<(), WorkerError> {
        let topic = self.topics.device(device_id, Channel::CmdResponse);
        publish_json(bus, &topic, QoS::AtLeastOnce, false, response).await?;
        Ok(())
    }

    /// Retained full snapshot, then retained per-property fan-out so
    /// dashboards can subscribe to single values.
    async fn publish_state(
        &self,
        bus: &dyn BusClient,
        device_id: &str,
        update: StateUpdate,
    ) -> Result<(), WorkerError> {
        let topic = self.topics.device(device_id, Channel::State);
        publish_json(bus, &topic, QoS::AtLeastOnce, true, &update).await?;

        if let Value::Object(properties) = &update.state {
            for (property, value) in properties {
                let topic = self.topics.device_property(device_id, property);
                bus.publish(&topic, QoS::AtLeastOnce, true, serde_json::to_vec(value)?).await?;
            }
        }
        self.state_cache.lock().insert(device_id.to_string(), update.state);
        Ok(())
    }

    /// Device-scoped transient error. Never retained: errors are
    /// notifications, not state.
    async fn publish_device_error(
        &self,
        bus: &dyn BusClient,
        device_id: &str,
        error: &WorkerError,
    ) -> Result<(), WorkerError> {
        let severity = match error {
            WorkerError::DeviceUnreachable(_) => Severity::Warning,
            _ => Severity::Error,
        };
        let message = ErrorMessage::new(error.code(), error.to_string(), severity);
        let topic = self.topics.device(device_id, Channel::Error);
        publish_json(bus, &topic, QoS::AtLeastOnce, false, &message).await?;
        Ok(())
    }
}
