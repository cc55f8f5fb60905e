use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use trellis_bus::Presence;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Définition persistée d'une instance de connecteur.
/// Propriété de l'Instance Store ; lecture seule pour l'orchestrateur et le worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Unique par type de connecteur.
    pub id: String,
    pub connector_type: String,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Config libre du connecteur (clé réservée `secrets` refusée ici,
    /// le sous-système secrets la réinjecte par son propre canal).
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Posés par le store à la création ; omissibles côté client.
    #[serde(with = "time::serde::rfc3339", default = "OffsetDateTime::now_utc")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339", default = "OffsetDateTime::now_utc")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
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

/// États du cycle de vie d'un connecteur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Configuring,
    Building,
    Starting,
    Initializing,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Failed,
    Removed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Configuring => "configuring",
            LifecycleState::Building => "building",
            LifecycleState::Starting => "starting",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Crashed => "crashed",
            LifecycleState::Failed => "failed",
            LifecycleState::Removed => "removed",
        }
    }
}

/// Vue d'un conteneur géré. Jamais persistée : toujours re-dérivable de
/// l'InstanceConfig + l'état du runtime conteneur.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerRecord {
    pub name: String,
    pub image: String,
    pub connector_type: String,
    pub instance_id: String,
    pub runtime_state: String,
    pub lifecycle: LifecycleState,
}

/// Présence observée d'une instance via son topic status retained.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub presence: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

impl InstanceStatus {
    pub fn observed(instance_id: &str, presence: Presence) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            presence: presence.as_str().to_string(),
            last_seen: OffsetDateTime::now_utc(),
        }
    }
}

pub type StatusMap = HashMap<String, InstanceStatus>;

/// État runtime suivi par l'orchestrateur, par instance_id.
#[derive(Debug, Clone)]
pub struct InstanceRuntime {
    pub connector_type: String,
    pub state: LifecycleState,
}

pub type LifecycleMap = HashMap<String, InstanceRuntime>;
