//! Worker configuration.
//!
//! Identity comes from the environment injected by the hub at unit creation
//! (TRELLIS_INSTANCE_ID, TRELLIS_CONNECTOR_TYPE, TRELLIS_MODE, broker
//! coordinates). The instance definition is read from the read-only mount
//! at /etc/trellis/instance.json, and the hub's settings file mounted at
//! /etc/trellis/settings.yaml fills any broker coordinates the environment
//! left out. All paths can be overridden for local development outside a
//! unit.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::WorkerError;

pub const DEFAULT_INSTANCE_CONFIG: &str = "/etc/trellis/instance.json";
pub const DEFAULT_SETTINGS_FILE: &str = "/etc/trellis/settings.yaml";

/// Execution mode of this worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    Normal,
    /// Extends devices owned by other instances, publishes no root state.
    Parasite,
}

impl WorkerMode {
    fn from_env(raw: &str) -> Self {
        match raw {
            "parasite" => WorkerMode::Parasite,
            _ => WorkerMode::Normal,
        }
    }
}

/// Instance definition as the worker sees it (mirror of the hub's persisted
/// shape, minus the bookkeeping timestamps it has no use for).
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerInstance {
    pub id: String,
    pub connector_type: String,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

fn default_enabled() -> bool {
    true
}

/// Subset of the hub's settings file relevant to a worker. Everything is
/// optional: the environment wins, the file fills the gaps.
#[derive(Debug, Clone, Default, Deserialize)]
struct SharedSettings {
    #[serde(default)]
    mqtt: BrokerSettings,
    base_topic: Option<String>,
    staleness_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct BrokerSettings {
    host: Option<String>,
    port: Option<u16>,
}

/// The settings mount is optional outside a unit; a missing file yields
/// defaults, a malformed one is a hard error.
async fn load_shared_settings(path: &Path) -> Result<SharedSettings, WorkerError> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(serde_yaml::from_str(&raw)?),
        Err(_) => Ok(SharedSettings::default()),
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub instance_id: String,
    pub connector_type: String,
    pub mode: WorkerMode,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub base_topic: String,
    /// Commands older than this are dropped silently.
    pub staleness: Duration,
    pub poll_interval: Duration,
    pub instance: WorkerInstance,
}

impl WorkerConfig {
    /// Loads identity from the environment and the instance definition from
    /// its mounted file. Fails loudly: a worker without identity or config
    /// has nothing useful to do.
    pub async fn load() -> Result<Self, WorkerError> {
        let instance_id = require_env("TRELLIS_INSTANCE_ID")?;
        let connector_type = require_env("TRELLIS_CONNECTOR_TYPE")?;
        let mode = WorkerMode::from_env(
            &std::env::var("TRELLIS_MODE").unwrap_or_else(|_| "normal".into()),
        );

        let settings_path = PathBuf::from(
            std::env::var("TRELLIS_SETTINGS_FILE").unwrap_or_else(|_| DEFAULT_SETTINGS_FILE.into()),
        );
        let shared = load_shared_settings(&settings_path).await?;

        let mqtt_host = std::env::var("TRELLIS_MQTT_HOST")
            .ok()
            .or(shared.mqtt.host)
            .unwrap_or_else(|| "localhost".into());
        let mqtt_port = std::env::var("TRELLIS_MQTT_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(shared.mqtt.port)
            .unwrap_or(1883);
        let base_topic = std::env::var("TRELLIS_BASE_TOPIC")
            .ok()
            .or(shared.base_topic)
            .unwrap_or_else(|| trellis_bus::DEFAULT_BASE.into());
        let staleness = std::env::var("TRELLIS_STALENESS_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(shared.staleness_seconds)
            .unwrap_or(30);
        let poll_interval = std::env::var("TRELLIS_POLL_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let config_path = PathBuf::from(
            std::env::var("TRELLIS_INSTANCE_CONFIG")
                .unwrap_or_else(|_| DEFAULT_INSTANCE_CONFIG.into()),
        );
        let raw = tokio::fs::read_to_string(&config_path).await.map_err(|e| {
            WorkerError::Config(format!("cannot read {}: {e}", config_path.display()))
        })?;
        let instance: WorkerInstance = serde_json::from_str(&raw)?;

        if instance.id != instance_id {
            return Err(WorkerError::Config(format!(
                "mounted config is for instance '{}', environment says '{}'",
                instance.id, instance_id
            )));
        }

        Ok(Self {
            instance_id,
            connector_type,
            mode,
            mqtt_host,
            mqtt_port,
            base_topic,
            staleness: Duration::from_secs(staleness),
            poll_interval: Duration::from_secs(poll_interval),
            instance,
        })
    }
}

fn require_env(key: &str) -> Result<String, WorkerError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| WorkerError::Config(format!("{key} is not set")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shared_settings_parsed_from_mount() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(
            &path,
            "mqtt:\n  host: broker.lan\n  port: 8883\nbase_topic: greenhouse\nstaleness_seconds: 12\n",
        )
        .unwrap();

        let shared = load_shared_settings(&path).await.unwrap();
        assert_eq!(shared.mqtt.host.as_deref(), Some("broker.lan"));
        assert_eq!(shared.mqtt.port, Some(8883));
        assert_eq!(shared.base_topic.as_deref(), Some("greenhouse"));
        assert_eq!(shared.staleness_seconds, Some(12));
    }

    #[tokio::test]
    async fn test_missing_settings_mount_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let shared = load_shared_settings(&dir.path().join("absent.yaml")).await.unwrap();
        assert!(shared.mqtt.host.is_none());
        assert!(shared.base_topic.is_none());
    }

    #[tokio::test]
    async fn test_malformed_settings_mount_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "mqtt: [not, a, map\n").unwrap();
        assert!(matches!(
            load_shared_settings(&path).await,
            Err(WorkerError::Yaml(_))
        ));
    }

    // Env beats file; the file fills what the env left out.
    #[tokio::test]
    async fn test_env_overrides_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let instance_path = dir.path().join("instance.json");
        std::fs::write(&instance_path, r#"{"id":"lamp_1","connector_type":"virtual"}"#).unwrap();
        let settings_path = dir.path().join("settings.yaml");
        std::fs::write(&settings_path, "mqtt:\n  host: broker.lan\n  port: 8883\n").unwrap();

        std::env::set_var("TRELLIS_INSTANCE_ID", "lamp_1");
        std::env::set_var("TRELLIS_CONNECTOR_TYPE", "virtual");
        std::env::set_var("TRELLIS_INSTANCE_CONFIG", &instance_path);
        std::env::set_var("TRELLIS_SETTINGS_FILE", &settings_path);
        std::env::set_var("TRELLIS_MQTT_HOST", "env-broker");
        std::env::remove_var("TRELLIS_MQTT_PORT");

        let cfg = WorkerConfig::load().await.unwrap();
        assert_eq!(cfg.mqtt_host, "env-broker");
        assert_eq!(cfg.mqtt_port, 8883);

        for key in [
            "TRELLIS_INSTANCE_ID",
            "TRELLIS_CONNECTOR_TYPE",
            "TRELLIS_INSTANCE_CONFIG",
            "TRELLIS_SETTINGS_FILE",
            "TRELLIS_MQTT_HOST",
        ] {
            std::env::remove_var(key);
        }
    }
}
