/**
 * INSTANCE STORE - Persistance des définitions d'instances
 *
 * RÔLE : CRUD + unicité des InstanceConfig, résolution des chemins fichiers.
 * Aucune logique métier au-delà : l'orchestrateur et le worker lisent,
 * seul le moteur de setup (externe) écrit à travers l'API du hub.
 *
 * LAYOUT : {data_dir}/connectors/{connector_type}/{instance_id}.json
 * Un fichier JSON pretty par instance, comme la persistance agents du kernel.
 */
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs;
use tracing::info;

use crate::error::HubError;
use crate::models::InstanceConfig;

pub struct InstanceStore {
    data_dir: PathBuf,
}

impl InstanceStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self { data_dir: data_dir.as_ref().to_path_buf() }
    }

    fn connector_dir(&self, connector_type: &str) -> PathBuf {
        self.data_dir.join("connectors").join(connector_type)
    }

    /// Chemin hôte du fichier de config d'une instance. C'est ce chemin,
    /// re-raciné à plat dans l'unité, que l'orchestrateur monte.
    pub fn config_path(&self, connector_type: &str, instance_id: &str) -> PathBuf {
        self.connector_dir(connector_type).join(format!("{instance_id}.json"))
    }

    /// Crée une instance. L'id doit être unique pour son type de connecteur.
    pub async fn create(&self, mut cfg: InstanceConfig) -> Result<InstanceConfig, HubError> {
        validate(&cfg)?;
        let path = self.config_path(&cfg.connector_type, &cfg.id);
        if path.exists() {
            return Err(HubError::AlreadyExists(format!("{}/{}", cfg.connector_type, cfg.id)));
        }

        let now = OffsetDateTime::now_utc();
        cfg.created_at = now;
        cfg.updated_at = now;

        fs::create_dir_all(self.connector_dir(&cfg.connector_type)).await?;
        self.write(&path, &cfg).await?;
        info!("instance créée: {}/{}", cfg.connector_type, cfg.id);
        Ok(cfg)
    }

    pub async fn get(&self, connector_type: &str, instance_id: &str) -> Result<InstanceConfig, HubError> {
        let path = self.config_path(connector_type, instance_id);
        if !path.exists() {
            return Err(HubError::NotFound(format!("{connector_type}/{instance_id}")));
        }
        let content = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Liste toutes les instances, optionnellement filtrées par type.
    pub async fn list(&self, connector_type: Option<&str>) -> Result<Vec<InstanceConfig>, HubError> {
        let root = self.data_dir.join("connectors");
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut dirs = fs::read_dir(&root).await?;
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.path().is_dir() {
                continue;
            }
            let ty = dir.file_name().to_string_lossy().to_string();
            if let Some(filter) = connector_type {
                if ty != filter {
                    continue;
                }
            }
            let mut files = fs::read_dir(dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                if file.path().extension().and_then(|s| s.to_str()) != Some("json") {
                    continue;
                }
                let content = fs::read_to_string(file.path()).await?;
                match serde_json::from_str::<InstanceConfig>(&content) {
                    Ok(cfg) => out.push(cfg),
                    Err(e) => tracing::warn!("config illisible {:?}: {e}", file.path()),
                }
            }
        }
        out.sort_by(|a, b| (&a.connector_type, &a.id).cmp(&(&b.connector_type, &b.id)));
        Ok(out)
    }

    /// Remplace la définition (l'instance doit exister). `created_at` est
    /// conservé, `updated_at` avancé.
    pub async fn update(&self, mut cfg: InstanceConfig) -> Result<InstanceConfig, HubError> {
        validate(&cfg)?;
        let existing = self.get(&cfg.connector_type, &cfg.id).await?;
        cfg.created_at = existing.created_at;
        cfg.updated_at = OffsetDateTime::now_utc();
        let path = self.config_path(&cfg.connector_type, &cfg.id);
        self.write(&path, &cfg).await?;
        Ok(cfg)
    }

    pub async fn delete(&self, connector_type: &str, instance_id: &str) -> Result<(), HubError> {
        let path = self.config_path(connector_type, instance_id);
        if !path.exists() {
            return Err(HubError::NotFound(format!("{connector_type}/{instance_id}")));
        }
        fs::remove_file(&path).await?;
        info!("instance supprimée: {connector_type}/{instance_id}");
        Ok(())
    }

    async fn write(&self, path: &Path, cfg: &InstanceConfig) -> Result<(), HubError> {
        let content = serde_json::to_string_pretty(cfg)?;
        fs::write(path, content).await?;
        Ok(())
    }
}

fn valid_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn validate(cfg: &InstanceConfig) -> Result<(), HubError> {
    if !valid_identifier(&cfg.id) {
        return Err(HubError::InvalidConfig(format!(
            "instance id '{}' (attendu [a-z0-9_-]+)",
            cfg.id
        )));
    }
    if !valid_identifier(&cfg.connector_type) {
        return Err(HubError::InvalidConfig(format!(
            "connector type '{}' (attendu [a-z0-9_-]+)",
            cfg.connector_type
        )));
    }
    let mut seen = std::collections::HashSet::new();
    for device in &cfg.devices {
        if device.device_id.is_empty() {
            return Err(HubError::InvalidConfig("device_id vide".to_string()));
        }
        if !seen.insert(device.device_id.as_str()) {
            return Err(HubError::InvalidConfig(format!(
                "device_id '{}' dupliqué dans l'instance",
                device.device_id
            )));
        }
    }
    // La clé `secrets` appartient au sous-système secrets : elle est retirée
    // avant l'Instance Store et réinjectée dans l'unité par un canal dédié.
    if cfg.config.contains_key("secrets") {
        return Err(HubError::InvalidConfig(
            "la clé 'secrets' ne doit pas atteindre l'Instance Store".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceEntry;
    use serde_json::Map;

    fn instance(id: &str, ty: &str) -> InstanceConfig {
        InstanceConfig {
            id: id.to_string(),
            connector_type: ty.to_string(),
            devices: vec![DeviceEntry {
                device_id: "light1".to_string(),
                enabled: true,
                settings: Map::new(),
            }],
            groups: vec![],
            config: Map::new(),
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_create_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path());

        let created = store.create(instance("yeelight_a1b2c3", "yeelight")).await.unwrap();
        let loaded = store.get("yeelight", "yeelight_a1b2c3").await.unwrap();
        assert_eq!(loaded.id, created.id);
        assert_eq!(loaded.devices[0].device_id, "light1");
    }

    #[tokio::test]
    async fn test_uniqueness_per_connector_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path());

        store.create(instance("a1", "yeelight")).await.unwrap();
        assert!(matches!(
            store.create(instance("a1", "yeelight")).await,
            Err(HubError::AlreadyExists(_))
        ));
        // Même id sous un autre type de connecteur : autorisé.
        store.create(instance("a1", "hue")).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_requires_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path());
        assert!(matches!(store.update(instance("x", "y")).await, Err(HubError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rejects_bad_ids_and_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path());

        assert!(store.create(instance("Bad Id", "yeelight")).await.is_err());

        let mut with_secrets = instance("ok_1", "yeelight");
        with_secrets.config.insert("secrets".to_string(), serde_json::json!({"token": "x"}));
        assert!(matches!(
            store.create(with_secrets).await,
            Err(HubError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_device_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path());
        let mut cfg = instance("dup_1", "yeelight");
        cfg.devices.push(cfg.devices[0].clone());
        assert!(matches!(store.create(cfg).await, Err(HubError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_list_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path());
        store.create(instance("a1", "yeelight")).await.unwrap();
        store.create(instance("b2", "hue")).await.unwrap();

        assert_eq!(store.list(None).await.unwrap().len(), 2);
        let only = store.list(Some("hue")).await.unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].id, "b2");
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path());
        store.create(instance("a1", "yeelight")).await.unwrap();
        store.delete("yeelight", "a1").await.unwrap();
        assert!(matches!(store.get("yeelight", "a1").await, Err(HubError::NotFound(_))));
    }
}
