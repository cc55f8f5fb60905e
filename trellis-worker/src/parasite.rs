//! Parasite runtime: extend foreign device namespaces.
//!
//! A parasite worker subscribes read-only to its parents' retained state,
//! derives extension fields, and publishes them strictly under
//! `{parent}/state/{field}`. It never writes the parent's root state and is
//! commanded only through its own namespace. Correlation key: the parasite
//! device entry carries the same device_id as the parent device it extends.

use parking_lot::Mutex;
use rumqttc::QoS;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use trellis_bus::{
    publish_json, validate_targets, BusClient, ParasiteRegistration, ParasiteTarget, StateUpdate,
    TopicSpace,
};

use crate::config::{DeviceEntry, WorkerConfig};
use crate::connector::ParasiteCompute;
use crate::error::WorkerError;

/// Default bound on declared extension chains (parasite of a parasite).
pub const DEFAULT_MAX_CHAIN_DEPTH: u64 = 3;

pub struct ParasiteRuntime {
    topics: TopicSpace,
    /// (device entry, validated target), one per extended parent.
    targets: Vec<(DeviceEntry, ParasiteTarget)>,
    /// Last known parent state, keyed by parent_path.
    parent_states: Mutex<HashMap<String, Value>>,
}

impl ParasiteRuntime {
    /// Builds the runtime from the instance definition: every enabled
    /// device entry must carry a `parasite` settings object naming its
    /// parent. Cycle and chain-depth guards run here, at startup, so a
    /// misconfigured parasite never reaches the bus.
    pub fn from_config(config: &WorkerConfig) -> Result<Self, WorkerError> {
        let max_depth = config
            .instance
            .config
            .get("max_chain_depth")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_CHAIN_DEPTH);

        let mut targets = Vec::new();
        for device in config.instance.devices.iter().filter(|d| d.enabled) {
            let raw = device.settings.get("parasite").ok_or_else(|| {
                WorkerError::Config(format!(
                    "device '{}' has no parasite target in parasite mode",
                    device.device_id
                ))
            })?;
            let target: ParasiteTarget = serde_json::from_value(raw.clone())?;
            if target.parent_device_id != device.device_id {
                return Err(WorkerError::Config(format!(
                    "device '{}' must carry the device_id of the parent it extends (got '{}')",
                    device.device_id, target.parent_device_id
                )));
            }
            targets.push((device.clone(), target));
        }

        let flat: Vec<ParasiteTarget> = targets.iter().map(|(_, t)| t.clone()).collect();
        validate_targets(&config.instance_id, &flat, max_depth)?;

        Ok(Self {
            topics: TopicSpace::new(&config.base_topic, &config.instance_id),
            targets,
            parent_states: Mutex::new(HashMap::new()),
        })
    }

    pub fn targets(&self) -> impl Iterator<Item = &ParasiteTarget> {
        self.targets.iter().map(|(_, t)| t)
    }

    /// Read-only subscriptions to the parents' retained state topics.
    pub fn subscriptions(&self) -> Vec<String> {
        self.targets.iter().map(|(_, t)| t.state_topic()).collect()
    }

    /// Self-registration, retained on this instance's own parasite topic.
    /// External tooling rebuilds the extension graph from these.
    pub async fn register(&self, bus: &dyn BusClient) -> Result<(), WorkerError> {
        let flat: Vec<ParasiteTarget> = self.targets.iter().map(|(_, t)| t.clone()).collect();
        let registration = ParasiteRegistration::new(&flat);
        publish_json(bus, &self.topics.parasite(), QoS::AtLeastOnce, true, &registration).await?;
        info!("registered as parasite of {} parent(s)", self.targets.len());
        Ok(())
    }

    /// Routes an incoming publish if it is one of our parent state topics.
    /// Returns true when the message was consumed.
    pub fn handle_parent_state(&self, topic: &str, payload: &[u8]) -> bool {
        let Some((_, target)) = self.targets.iter().find(|(_, t)| t.state_topic() == topic) else {
            return false;
        };
        match serde_json::from_slice::<StateUpdate>(payload) {
            Ok(update) => {
                debug!("parent state refreshed for {}", target.parent_path);
                self.parent_states.lock().insert(target.parent_path.clone(), update.state);
            }
            Err(e) => warn!("unreadable parent state on {topic}: {e}"),
        }
        true
    }

    pub fn parent_state(&self, parent_path: &str) -> Option<Value> {
        self.parent_states.lock().get(parent_path).cloned()
    }

    /// Publishes extension fields for one target, each retained on its own
    /// `{parent}/state/{field}` topic. `field_topic` rejects anything that
    /// would escape that subspace.
    pub async fn publish_fields(
        &self,
        bus: &dyn BusClient,
        target: &ParasiteTarget,
        fields: &Map<String, Value>,
    ) -> Result<(), WorkerError> {
        for (field, value) in fields {
            let topic = target.field_topic(field)?;
            bus.publish(&topic, QoS::AtLeastOnce, true, serde_json::to_vec(value)?).await?;
        }
        Ok(())
    }

    /// One derivation pass: for each target, feed the parent's last known
    /// state to the connector and publish whatever fields come back. A
    /// parent that has never published yet yields nothing.
    pub async fn compute_cycle(
        &self,
        bus: &dyn BusClient,
        compute: &dyn ParasiteCompute,
    ) -> Result<(), WorkerError> {
        for (device, target) in &self.targets {
            let parent = self.parent_state(&target.parent_path);
            if let Some(fields) = compute.compute_fields(device, parent.as_ref()) {
                self.publish_fields(bus, target, &fields).await?;
            }
        }
        Ok(())
    }
}
