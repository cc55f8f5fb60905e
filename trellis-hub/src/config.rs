use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, path::PathBuf};
use tokio::fs;
use tracing::warn;

/// Réglages du hub, chargés depuis `hub.yaml` (ou `TRELLIS_HUB_CONFIG`).
/// Le fichier est aussi celui monté en lecture seule dans chaque unité
/// comme fichier de réglages globaux.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HubSettings {
    pub mqtt: MqttConf,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_connectors_dir")]
    pub connectors_dir: PathBuf,
    /// Bibliothèques runtime partagées, montées dans chaque unité.
    #[serde(default = "default_lib_dir")]
    pub lib_dir: PathBuf,
    #[serde(default = "default_api_bind")]
    pub api_bind: String,
    /// Seuil de péremption des commandes, relayé aux workers.
    #[serde(default = "default_staleness")]
    pub staleness_seconds: u64,
    #[serde(default = "default_grace")]
    pub stop_grace_seconds: u64,
    /// Budget de redémarrages avant passage en Failed.
    #[serde(default = "default_restart_budget")]
    pub restart_budget: u32,
    /// Réglages globaux injectés dans chaque unité (TRELLIS_<CLÉ>).
    #[serde(default)]
    pub globals: HashMap<String, String>,
    /// Chemin d'origine du fichier (pour le montage). Pas sérialisé.
    #[serde(skip)]
    pub source_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

fn default_base_topic() -> String {
    trellis_bus::DEFAULT_BASE.to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_connectors_dir() -> PathBuf {
    PathBuf::from("./connectors")
}
fn default_lib_dir() -> PathBuf {
    PathBuf::from("./lib")
}
fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_staleness() -> u64 {
    30
}
fn default_grace() -> u64 {
    10
}
fn default_restart_budget() -> u32 {
    5
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            mqtt: MqttConf { host: "localhost".into(), port: 1883 },
            base_topic: default_base_topic(),
            data_dir: default_data_dir(),
            connectors_dir: default_connectors_dir(),
            lib_dir: default_lib_dir(),
            api_bind: default_api_bind(),
            staleness_seconds: default_staleness(),
            stop_grace_seconds: default_grace(),
            restart_budget: default_restart_budget(),
            globals: HashMap::new(),
            source_path: PathBuf::from("hub.yaml"),
        }
    }
}

pub async fn load_settings() -> HubSettings {
    let path = std::env::var("TRELLIS_HUB_CONFIG").unwrap_or_else(|_| "hub.yaml".into());
    let mut settings = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            HubSettings::default()
        } else {
            serde_yaml::from_str(&txt).unwrap_or_else(|e| {
                warn!("config invalide ({path}): {e}, usage config par défaut");
                HubSettings::default()
            })
        }
    } else {
        warn!("pas de {path}, écriture de la config par défaut");
        let defaults = HubSettings::default();
        // Le fichier doit exister : il est monté dans chaque unité.
        if let Ok(txt) = serde_yaml::to_string(&defaults) {
            let _ = fs::write(&path, txt).await;
        }
        defaults
    };
    settings.source_path = PathBuf::from(path);
    settings
}
