//! Virtual connector: in-memory devices for demos and end-to-end testing.
//!
//! Holds device state in process memory, applies commands by merging values,
//! and can run in parasite mode deriving a boolean `motion` field from a
//! numeric property of the parent state. No hardware required.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::config::DeviceEntry;
use crate::connector::{Connector, DeviceSnapshot, ParasiteCompute};
use crate::error::WorkerError;
use trellis_bus::{ColorFormat, NormalizerSet, PercentBounds, RelativeDelta};

pub struct VirtualConnector {
    states: Mutex<HashMap<String, Value>>,
}

impl VirtualConnector {
    pub fn new() -> Self {
        Self { states: Mutex::new(HashMap::new()) }
    }

    fn initial_state(device: &DeviceEntry) -> Value {
        device
            .settings
            .get("initial_state")
            .cloned()
            .unwrap_or_else(|| json!({"power": false, "brightness": 50}))
    }

    /// A device flagged `unreachable` in its settings simulates a dead
    /// transport, for exercising error localization.
    fn check_reachable(device: &DeviceEntry) -> Result<(), WorkerError> {
        if device.settings.get("unreachable").and_then(Value::as_bool).unwrap_or(false) {
            return Err(WorkerError::DeviceUnreachable(device.device_id.clone()));
        }
        Ok(())
    }
}

impl Default for VirtualConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for VirtualConnector {
    async fn start(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn poll_device(&self, device: &DeviceEntry) -> Result<DeviceSnapshot, WorkerError> {
        Self::check_reachable(device)?;
        let state = self
            .states
            .lock()
            .entry(device.device_id.clone())
            .or_insert_with(|| Self::initial_state(device))
            .clone();
        Ok(DeviceSnapshot { state, link_quality: Some(100) })
    }

    async fn handle_command(
        &self,
        device: &DeviceEntry,
        values: &Map<String, Value>,
    ) -> Result<Value, WorkerError> {
        Self::check_reachable(device)?;
        let mut states = self.states.lock();
        let state = states
            .entry(device.device_id.clone())
            .or_insert_with(|| Self::initial_state(device));
        if let Value::Object(object) = state {
            for (property, value) in values {
                object.insert(property.clone(), value.clone());
            }
        }
        Ok(state.clone())
    }

    fn normalizers(&self) -> NormalizerSet {
        let mut set = NormalizerSet::new();
        set.register(Box::new(RelativeDelta));
        set.register(Box::new(PercentBounds::new("brightness", 0.0, 100.0)));
        set.register(Box::new(ColorFormat::new("color")));
        set
    }
}

impl ParasiteCompute for VirtualConnector {
    fn compute_fields(
        &self,
        device: &DeviceEntry,
        parent_state: Option<&Value>,
    ) -> Option<Map<String, Value>> {
        let parent = parent_state?;
        let watched = device
            .settings
            .get("watch_property")
            .and_then(Value::as_str)
            .unwrap_or("frame_delta");
        let threshold = device
            .settings
            .get("threshold")
            .and_then(Value::as_f64)
            .unwrap_or(10.0);

        let reading = parent.get(watched)?.as_f64()?;
        let mut fields = Map::new();
        fields.insert("motion".to_string(), json!(reading >= threshold));
        Some(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(settings: Value) -> DeviceEntry {
        DeviceEntry {
            device_id: "light1".to_string(),
            enabled: true,
            settings: settings.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn test_command_merges_into_state() {
        let connector = VirtualConnector::new();
        let dev = device(json!({}));
        let mut values = Map::new();
        values.insert("power".to_string(), json!(true));
        let state = connector.handle_command(&dev, &values).await.unwrap();
        assert_eq!(state["power"], json!(true));
        assert_eq!(state["brightness"], json!(50));

        let snapshot = connector.poll_device(&dev).await.unwrap();
        assert_eq!(snapshot.state["power"], json!(true));
    }

    #[tokio::test]
    async fn test_unreachable_flag() {
        let connector = VirtualConnector::new();
        let dev = device(json!({"unreachable": true}));
        assert!(matches!(
            connector.poll_device(&dev).await,
            Err(WorkerError::DeviceUnreachable(_))
        ));
    }

    #[test]
    fn test_motion_derivation() {
        let connector = VirtualConnector::new();
        let dev = device(json!({"threshold": 5.0}));

        assert!(connector.compute_fields(&dev, None).is_none());

        let calm = json!({"frame_delta": 1.2});
        let fields = connector.compute_fields(&dev, Some(&calm)).unwrap();
        assert_eq!(fields["motion"], json!(false));

        let busy = json!({"frame_delta": 9.0});
        let fields = connector.compute_fields(&dev, Some(&busy)).unwrap();
        assert_eq!(fields["motion"], json!(true));
    }
}
