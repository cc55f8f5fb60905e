//! Parasite-mode behaviour: registration, parent state tracking, field
//! publications confined to the parent's state subspace, and command
//! isolation between parasite and parent namespaces.

use serde_json::{json, Map};
use std::time::Duration;
use trellis_devkit::{TestHarness, WireMessageBuilder};
use trellis_worker::config::{DeviceEntry, WorkerConfig, WorkerInstance, WorkerMode};
use trellis_worker::connector::ParasiteCompute;
use trellis_worker::parasite::ParasiteRuntime;
use trellis_worker::runtime::WorkerRuntime;
use trellis_worker::virtual_connector::VirtualConnector;

const PARENT_PATH: &str = "trellis/v1/instances/cam_1/devices/camera_1";

fn parasite_device() -> DeviceEntry {
    let settings = json!({
        "threshold": 5.0,
        "parasite": {
            "parent_path": PARENT_PATH,
            "parent_device_id": "camera_1",
            "parent_instance_id": "cam_1",
        }
    });
    DeviceEntry {
        device_id: "camera_1".to_string(),
        enabled: true,
        settings: settings.as_object().cloned().unwrap(),
    }
}

fn parasite_config(devices: Vec<DeviceEntry>) -> WorkerConfig {
    WorkerConfig {
        instance_id: "motion_9".to_string(),
        connector_type: "virtual".to_string(),
        mode: WorkerMode::Parasite,
        mqtt_host: "localhost".to_string(),
        mqtt_port: 1883,
        base_topic: "trellis".to_string(),
        staleness: Duration::from_secs(30),
        poll_interval: Duration::from_secs(30),
        instance: WorkerInstance {
            id: "motion_9".to_string(),
            connector_type: "virtual".to_string(),
            devices,
            groups: vec![],
            config: Map::new(),
        },
    }
}

#[tokio::test]
async fn test_registration_is_retained_on_own_topic() {
    let harness = TestHarness::new();
    let parasite = ParasiteRuntime::from_config(&parasite_config(vec![parasite_device()])).unwrap();

    parasite.register(&harness.bus).await.unwrap();

    let reg = harness.bus.find_messages_by_topic("trellis/v1/instances/motion_9/parasite");
    assert_eq!(reg.len(), 1);
    assert!(reg[0].retain);
    harness
        .assert_field_equals(
            "trellis/v1/instances/motion_9/parasite",
            "targets",
            &json!([PARENT_PATH]),
        )
        .unwrap();
}

#[tokio::test]
async fn test_fields_published_only_under_parent_state() {
    let harness = TestHarness::new();
    let config = parasite_config(vec![parasite_device()]);
    let parasite = ParasiteRuntime::from_config(&config).unwrap();
    let connector = VirtualConnector::new();

    assert_eq!(parasite.subscriptions(), vec![format!("{PARENT_PATH}/state")]);

    // Parent publishes a busy frame; the parasite derives motion=true.
    let parent = WireMessageBuilder::state_update("camera_1", json!({"frame_delta": 9.0}));
    assert!(parasite.handle_parent_state(
        &format!("{PARENT_PATH}/state"),
        &serde_json::to_vec(&parent).unwrap()
    ));
    parasite.compute_cycle(&harness.bus, &connector).await.unwrap();

    let motion = harness.bus.find_messages_by_topic(&format!("{PARENT_PATH}/state/motion"));
    assert_eq!(motion.len(), 1);
    assert!(motion[0].retain);
    assert_eq!(motion[0].payload, b"true");

    // The parent's root state topic is never written by the parasite.
    harness.assert_no_message(&format!("{PARENT_PATH}/state")).unwrap();
}

#[tokio::test]
async fn test_no_publication_before_parent_state_arrives() {
    let harness = TestHarness::new();
    let parasite = ParasiteRuntime::from_config(&parasite_config(vec![parasite_device()])).unwrap();
    let connector = VirtualConnector::new();

    parasite.compute_cycle(&harness.bus, &connector).await.unwrap();
    assert!(harness.bus.get_published_messages().is_empty());
}

#[tokio::test]
async fn test_foreign_topics_are_not_consumed() {
    let parasite = ParasiteRuntime::from_config(&parasite_config(vec![parasite_device()])).unwrap();
    assert!(!parasite.handle_parent_state("trellis/v1/instances/other/devices/d/state", b"{}"));
}

#[tokio::test]
async fn test_parasite_commanded_through_own_namespace() {
    let harness = TestHarness::new();
    let config = parasite_config(vec![parasite_device()]);
    let rt = WorkerRuntime::new(config, Box::new(VirtualConnector::new()));

    let cmd = WireMessageBuilder::command("c1", json!({"sensitivity": 80}));
    rt.handle_command(&harness.bus, "camera_1", &serde_json::to_vec(&cmd).unwrap())
        .await
        .unwrap();

    // Response and state land in the parasite's own namespace, not the
    // parent's.
    harness
        .assert_field_equals(
            "trellis/v1/instances/motion_9/devices/camera_1/cmd/response",
            "status",
            &json!("success"),
        )
        .unwrap();
    harness.assert_no_message(&format!("{PARENT_PATH}/cmd/response")).unwrap();
}

#[test]
fn test_device_id_mismatch_rejected_at_startup() {
    let mut dev = parasite_device();
    dev.device_id = "sensor_a".to_string();
    let err = ParasiteRuntime::from_config(&parasite_config(vec![dev]));
    assert!(err.is_err());
}

#[test]
fn test_self_targeting_rejected_at_startup() {
    let mut dev = parasite_device();
    let parasite = dev.settings.get_mut("parasite").unwrap();
    parasite["parent_instance_id"] = json!("motion_9");
    assert!(ParasiteRuntime::from_config(&parasite_config(vec![dev])).is_err());
}

#[test]
fn test_motion_flips_with_threshold() {
    let connector = VirtualConnector::new();
    let dev = parasite_device();
    let calm = json!({"frame_delta": 0.5});
    let fields = connector.compute_fields(&dev, Some(&calm)).unwrap();
    assert_eq!(fields["motion"], json!(false));
}
