/**
 * CONTAINER ORCHESTRATOR - Cycle de vie des unités d'isolation
 *
 * RÔLE :
 * Construit, crée, démarre, arrête et supprime les conteneurs des instances.
 * Nom d'unité déterministe, trois montages lecture seule, environnement
 * d'identité injecté, politique de redémarrage unless-stopped.
 *
 * FONCTIONNEMENT :
 * - create() : résout la recette, build l'image si absente, crée l'unité
 * - start/stop/restart/remove : opérations sérialisées par instance_id
 * - spawn_crash_monitor() : surveille les boucles de crash, budget borné
 *
 * INVARIANTS :
 * - unit_name est une fonction pure de (connector_type, instance_id)
 * - échec build/start = résultat synchrone, aucune unité partielle
 * - les transitions Initializing→Running viennent de l'écoute du statut
 *   retained sur le bus, jamais du runtime conteneur
 */
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};
use trellis_bus::Presence;

use crate::config::HubSettings;
use crate::connectors::{BuildRecipe, ConnectorCatalog};
use crate::docker::ContainerCli;
use crate::error::HubError;
use crate::logs::LogLine;
use crate::models::{
    new_state, ContainerRecord, InstanceConfig, InstanceRuntime, LifecycleMap, LifecycleState, Shared,
};
use crate::mounts::HostPathResolver;
use crate::store::InstanceStore;

/// Label commun à toutes les unités gérées.
pub const TYPE_LABEL: &str = "trellis.type=connector";

/// Chemins vus par le worker dans l'unité. La config d'instance est
/// re-racinée à plat : une image par type, chaque unité ne voit que son
/// propre fichier.
pub const UNIT_LIB_DIR: &str = "/opt/trellis/lib";
pub const UNIT_INSTANCE_CONFIG: &str = "/etc/trellis/instance.json";
pub const UNIT_SETTINGS: &str = "/etc/trellis/settings.yaml";

/// Nom d'unité déterministe. Fonction pure : create() est idempotent.
pub fn unit_name(connector_type: &str, instance_id: &str) -> String {
    format!("trellis-{}-{}", sanitize(connector_type), sanitize(instance_id))
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' { c } else { '-' })
        .collect()
}

/// Mode d'exécution de l'unité, depuis la config libre (`mode`).
fn unit_mode(cfg: &InstanceConfig) -> String {
    cfg.config
        .get("mode")
        .and_then(|v| v.as_str())
        .unwrap_or("normal")
        .to_string()
}

/// Arguments `docker create` d'une unité. Fonction pure sur ses entrées,
/// testable sans runtime conteneur.
pub fn build_create_args(
    settings: &HubSettings,
    resolver: &HostPathResolver,
    recipe: &BuildRecipe,
    cfg: &InstanceConfig,
    instance_config_path: &Path,
) -> Vec<String> {
    let name = unit_name(&cfg.connector_type, &cfg.id);
    let mut args: Vec<String> = vec![
        "create".into(),
        "--name".into(),
        name,
        "--label".into(),
        TYPE_LABEL.into(),
        "--label".into(),
        format!("trellis.connector={}", cfg.connector_type),
        "--label".into(),
        format!("trellis.instance={}", cfg.id),
        // Crash ⇒ redémarrage auto ; stop utilisateur ⇒ reste arrêté.
        "--restart".into(),
        "unless-stopped".into(),
    ];

    if recipe.host_network {
        args.push("--network".into());
        args.push("host".into());
    }

    // Exactement trois montages, tous lecture seule.
    let lib_host = resolver.resolve(&settings.lib_dir);
    let config_host = resolver.resolve(instance_config_path);
    let settings_host = resolver.resolve(&settings.source_path);
    for (host, unit) in [
        (lib_host, UNIT_LIB_DIR),
        (config_host, UNIT_INSTANCE_CONFIG),
        (settings_host, UNIT_SETTINGS),
    ] {
        args.push("-v".into());
        args.push(format!("{}:{}:ro", host.display(), unit));
    }

    // Environnement d'identité + réglages globaux.
    for (key, value) in [
        ("TRELLIS_INSTANCE_ID", cfg.id.clone()),
        ("TRELLIS_CONNECTOR_TYPE", cfg.connector_type.clone()),
        ("TRELLIS_MODE", unit_mode(cfg)),
        ("TRELLIS_MQTT_HOST", settings.mqtt.host.clone()),
        ("TRELLIS_MQTT_PORT", settings.mqtt.port.to_string()),
        ("TRELLIS_BASE_TOPIC", settings.base_topic.clone()),
        ("TRELLIS_STALENESS_SECONDS", settings.staleness_seconds.to_string()),
    ] {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    let mut globals: Vec<_> = settings.globals.iter().collect();
    globals.sort();
    for (key, value) in globals {
        args.push("-e".into());
        args.push(format!("TRELLIS_{}={}", key.to_uppercase(), value));
    }

    args.push(recipe.image_tag.clone());
    args
}

pub struct Orchestrator {
    cli: ContainerCli,
    settings: HubSettings,
    store: Arc<InstanceStore>,
    catalog: ConnectorCatalog,
    resolver: HostPathResolver,
    lifecycle: Shared<LifecycleMap>,
    /// Verrous par instance_id : restart vs stop vs remove ne se croisent
    /// jamais sur la même instance.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        cli: ContainerCli,
        settings: HubSettings,
        store: Arc<InstanceStore>,
        resolver: HostPathResolver,
    ) -> Self {
        let catalog = ConnectorCatalog::new(&settings.connectors_dir);
        Self {
            cli,
            settings,
            store,
            catalog,
            resolver,
            lifecycle: new_state(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, instance_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(instance_id.to_string()).or_default().clone()
    }

    fn set_state(&self, cfg_connector: &str, instance_id: &str, state: LifecycleState) {
        self.lifecycle.lock().insert(
            instance_id.to_string(),
            InstanceRuntime { connector_type: cfg_connector.to_string(), state },
        );
    }

    pub fn state_of(&self, instance_id: &str) -> Option<LifecycleState> {
        self.lifecycle.lock().get(instance_id).map(|r| r.state)
    }

    /// Crée l'unité d'une instance : Configuring → Building → Starting.
    /// Idempotent : si l'unité du nom dérivé existe déjà, elle est reprise
    /// telle quelle. Échec de build ⇒ l'instance reste au repos, aucune
    /// unité partielle.
    pub async fn create(&self, cfg: &InstanceConfig) -> Result<ContainerRecord, HubError> {
        let lock = self.lock_for(&cfg.id).await;
        let _guard = lock.lock().await;

        let unit = unit_name(&cfg.connector_type, &cfg.id);
        self.set_state(&cfg.connector_type, &cfg.id, LifecycleState::Configuring);

        let recipe = self.catalog.resolve_recipe(&cfg.connector_type).await?;
        self.set_state(&cfg.connector_type, &cfg.id, LifecycleState::Building);

        if let Some((dockerfile, context)) = &recipe.build {
            if !self.cli.image_exists(&recipe.image_tag).await {
                info!("build image {} pour {}", recipe.image_tag, cfg.connector_type);
                self.cli
                    .build(dockerfile, context, &recipe.image_tag, Duration::from_secs(600))
                    .await
                    .map_err(|e| {
                        self.set_state(&cfg.connector_type, &cfg.id, LifecycleState::Configuring);
                        HubError::BuildFailure {
                            connector: cfg.connector_type.clone(),
                            detail: e.to_string(),
                        }
                    })?;
            }
        }

        if !self.cli.exists(&unit).await {
            let config_path = self.store.config_path(&cfg.connector_type, &cfg.id);
            let args = build_create_args(&self.settings, &self.resolver, &recipe, cfg, &config_path);
            if let Err(e) = self.cli.create(args).await {
                // Pas d'unité partielle : on nettoie ce qui aurait pu naître.
                let _ = self.cli.remove(&unit, true).await;
                self.set_state(&cfg.connector_type, &cfg.id, LifecycleState::Configuring);
                return Err(HubError::StartFailure { unit, detail: e.to_string() });
            }
        }

        self.set_state(&cfg.connector_type, &cfg.id, LifecycleState::Starting);
        info!("unité {} créée", unit);
        Ok(ContainerRecord {
            name: unit,
            image: recipe.image_tag,
            connector_type: cfg.connector_type.clone(),
            instance_id: cfg.id.clone(),
            runtime_state: "created".to_string(),
            lifecycle: LifecycleState::Starting,
        })
    }

    /// Démarre l'unité. Running n'est atteint que quand le worker a publié
    /// `online` (voir l'écoute statut).
    pub async fn start(&self, connector_type: &str, instance_id: &str) -> Result<(), HubError> {
        let lock = self.lock_for(instance_id).await;
        let _guard = lock.lock().await;

        let unit = unit_name(connector_type, instance_id);
        if !self.cli.exists(&unit).await {
            return Err(HubError::NotFound(unit));
        }
        self.cli
            .start(&unit)
            .await
            .map_err(|e| HubError::StartFailure { unit: unit.clone(), detail: e.to_string() })?;
        self.set_state(connector_type, instance_id, LifecycleState::Initializing);
        info!("unité {} démarrée", unit);
        Ok(())
    }

    /// Arrêt deux phases (grâce puis kill), état Stopped à l'issue.
    pub async fn stop(
        &self,
        connector_type: &str,
        instance_id: &str,
        grace: Option<u64>,
    ) -> Result<(), HubError> {
        let lock = self.lock_for(instance_id).await;
        let _guard = lock.lock().await;
        self.stop_locked(connector_type, instance_id, grace).await
    }

    async fn stop_locked(
        &self,
        connector_type: &str,
        instance_id: &str,
        grace: Option<u64>,
    ) -> Result<(), HubError> {
        let unit = unit_name(connector_type, instance_id);
        if !self.cli.exists(&unit).await {
            return Err(HubError::NotFound(unit));
        }
        self.set_state(connector_type, instance_id, LifecycleState::Stopping);
        let grace = grace.unwrap_or(self.settings.stop_grace_seconds);
        self.cli.stop(&unit, grace).await?;
        self.set_state(connector_type, instance_id, LifecycleState::Stopped);
        info!("unité {} arrêtée", unit);
        Ok(())
    }

    /// Stop + start sous un seul verrou : pas de course avec remove/stop.
    pub async fn restart(
        &self,
        connector_type: &str,
        instance_id: &str,
        grace: Option<u64>,
    ) -> Result<(), HubError> {
        let lock = self.lock_for(instance_id).await;
        let _guard = lock.lock().await;

        self.stop_locked(connector_type, instance_id, grace).await?;
        let unit = unit_name(connector_type, instance_id);
        self.cli
            .start(&unit)
            .await
            .map_err(|e| HubError::StartFailure { unit, detail: e.to_string() })?;
        self.set_state(connector_type, instance_id, LifecycleState::Initializing);
        Ok(())
    }

    pub async fn remove(
        &self,
        connector_type: &str,
        instance_id: &str,
        force: bool,
    ) -> Result<(), HubError> {
        let lock = self.lock_for(instance_id).await;
        let _guard = lock.lock().await;

        let unit = unit_name(connector_type, instance_id);
        if self.cli.exists(&unit).await {
            if !force {
                // Arrêt propre d'abord : le worker publie son offline.
                let _ = self.cli.stop(&unit, self.settings.stop_grace_seconds).await;
            }
            self.cli.remove(&unit, force).await?;
        }
        // État terminal conservé : l'API peut encore le montrer. Un create()
        // ultérieur du même id repart de Configuring.
        self.set_state(connector_type, instance_id, LifecycleState::Removed);
        info!("unité {} supprimée", unit);
        Ok(())
    }

    /// Vue fusionnée : conteneurs labellisés + états suivis.
    pub async fn list(&self) -> Result<Vec<ContainerRecord>, HubError> {
        let entries = self.cli.list(TYPE_LABEL).await?;
        let lifecycle = self.lifecycle.lock().clone();
        Ok(entries
            .into_iter()
            .map(|e| {
                let state = lifecycle
                    .get(&e.instance_id)
                    .map(|r| r.state)
                    .unwrap_or(LifecycleState::Stopped);
                ContainerRecord {
                    name: e.name,
                    image: e.image,
                    connector_type: e.connector_type,
                    instance_id: e.instance_id,
                    runtime_state: e.state,
                    lifecycle: state,
                }
            })
            .collect())
    }

    pub fn logs(
        &self,
        connector_type: &str,
        instance_id: &str,
        tail: Option<u32>,
        since: Option<String>,
        follow: bool,
    ) -> Result<mpsc::Receiver<LogLine>, HubError> {
        let unit = unit_name(connector_type, instance_id);
        self.cli.stream_logs(&unit, tail, since, follow)
    }

    /// Transition pilotée par le statut retained observé sur le bus.
    pub fn on_presence(&self, instance_id: &str, presence: Presence) {
        let mut lifecycle = self.lifecycle.lock();
        let Some(runtime) = lifecycle.get_mut(instance_id) else {
            return;
        };
        match presence {
            Presence::Online => {
                if matches!(
                    runtime.state,
                    LifecycleState::Starting | LifecycleState::Initializing | LifecycleState::Crashed
                ) {
                    runtime.state = LifecycleState::Running;
                    info!("instance {instance_id} en ligne");
                }
            }
            Presence::Offline => {
                // Offline inattendu (last-will) pendant Running = crash ;
                // la politique de redémarrage du runtime va relancer.
                if runtime.state == LifecycleState::Running {
                    runtime.state = LifecycleState::Crashed;
                    warn!("instance {instance_id} hors ligne (last-will)");
                }
            }
        }
    }

    pub fn lifecycle_snapshot(&self) -> LifecycleMap {
        self.lifecycle.lock().clone()
    }
}

/// Surveillance des boucles de crash. Le runtime conteneur relance tout seul
/// (unless-stopped) ; ici on compte les relances et on coupe au-delà du
/// budget : l'instance passe Failed, visible opérateur, plus jamais relancée
/// automatiquement.
pub fn spawn_crash_monitor(orchestrator: Arc<Orchestrator>) {
    tokio::spawn(async move {
        let budget = orchestrator.settings.restart_budget;
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        let mut last_counts: HashMap<String, u32> = HashMap::new();
        let mut strikes: HashMap<String, u32> = HashMap::new();

        loop {
            interval.tick().await;

            let watched: Vec<(String, String)> = orchestrator
                .lifecycle_snapshot()
                .into_iter()
                .filter(|(_, r)| {
                    matches!(
                        r.state,
                        LifecycleState::Initializing | LifecycleState::Running | LifecycleState::Crashed
                    )
                })
                .map(|(id, r)| (id, r.connector_type))
                .collect();

            for (instance_id, connector_type) in watched {
                let unit = unit_name(&connector_type, &instance_id);
                let state = match orchestrator.cli.inspect_state(&unit).await {
                    Ok(Some(s)) => s,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("inspect {unit} impossible: {e}");
                        continue;
                    }
                };

                let prev = last_counts.insert(instance_id.clone(), state.restart_count);
                if let Some(prev) = prev {
                    if state.restart_count > prev {
                        let s = strikes.entry(instance_id.clone()).or_insert(0);
                        *s += state.restart_count - prev;
                        warn!(
                            "instance {instance_id}: {} redémarrages (budget {budget})",
                            *s
                        );
                        if *s > budget {
                            error!(
                                "instance {instance_id}: budget de redémarrages épuisé, passage en Failed"
                            );
                            let _ = orchestrator.stop(&connector_type, &instance_id, Some(0)).await;
                            orchestrator.set_state(&connector_type, &instance_id, LifecycleState::Failed);
                            strikes.remove(&instance_id);
                        }
                    } else {
                        // Fenêtre calme : on relâche la pression.
                        strikes.remove(&instance_id);
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceEntry;
    use serde_json::Map;
    use time::OffsetDateTime;

    fn sample_instance() -> InstanceConfig {
        InstanceConfig {
            id: "yeelight_a1b2c3".to_string(),
            connector_type: "yeelight".to_string(),
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

    fn sample_recipe() -> BuildRecipe {
        BuildRecipe {
            image_tag: "trellis-connector-yeelight:latest".to_string(),
            host_network: false,
            build: None,
        }
    }

    #[test]
    fn test_unit_name_is_pure_and_sanitized() {
        assert_eq!(unit_name("yeelight", "yeelight_a1b2c3"), "trellis-yeelight-yeelight_a1b2c3");
        assert_eq!(unit_name("yeelight", "yeelight_a1b2c3"), unit_name("yeelight", "yeelight_a1b2c3"));
        assert_eq!(unit_name("a b", "c/d"), "trellis-a-b-c-d");
    }

    #[test]
    fn test_create_args_identity_env_and_mounts() {
        let settings = HubSettings::default();
        let resolver = HostPathResolver::identity();
        let cfg = sample_instance();
        let path = std::path::PathBuf::from("./data/connectors/yeelight/yeelight_a1b2c3.json");

        let args = build_create_args(&settings, &resolver, &sample_recipe(), &cfg, &path);

        assert!(args.contains(&"TRELLIS_INSTANCE_ID=yeelight_a1b2c3".to_string()));
        assert!(args.contains(&"TRELLIS_CONNECTOR_TYPE=yeelight".to_string()));
        assert!(args.contains(&"TRELLIS_MODE=normal".to_string()));
        assert!(args.contains(&"trellis-yeelight-yeelight_a1b2c3".to_string()));
        assert!(args.contains(&"unless-stopped".to_string()));
        // Trois montages, tous :ro, config re-racinée à plat
        let mounts: Vec<&String> = args.iter().filter(|a| a.ends_with(":ro")).collect();
        assert_eq!(mounts.len(), 3);
        assert!(mounts.iter().any(|m| m.ends_with(&format!(":{UNIT_INSTANCE_CONFIG}:ro"))));
        // Pas de réseau hôte sans déclaration du connecteur
        assert!(!args.contains(&"--network".to_string()));
        // L'image est le dernier argument
        assert_eq!(args.last().unwrap(), "trellis-connector-yeelight:latest");
    }

    #[test]
    fn test_create_args_host_network_when_declared() {
        let settings = HubSettings::default();
        let resolver = HostPathResolver::identity();
        let cfg = sample_instance();
        let mut recipe = sample_recipe();
        recipe.host_network = true;
        let path = std::path::PathBuf::from("x.json");

        let args = build_create_args(&settings, &resolver, &recipe, &cfg, &path);
        let pos = args.iter().position(|a| a == "--network").unwrap();
        assert_eq!(args[pos + 1], "host");
    }

    #[test]
    fn test_create_args_globals_injected() {
        let mut settings = HubSettings::default();
        settings.globals.insert("tz".to_string(), "Europe/Paris".to_string());
        let args = build_create_args(
            &settings,
            &HostPathResolver::identity(),
            &sample_recipe(),
            &sample_instance(),
            std::path::Path::new("x.json"),
        );
        assert!(args.contains(&"TRELLIS_TZ=Europe/Paris".to_string()));
    }

    // Runtime conteneur `false` : toute commande échoue, donc exists() rend
    // false et aucune opération d'unité n'est tentée.
    fn orchestrator_without_runtime(data_dir: &std::path::Path) -> Orchestrator {
        Orchestrator::new(
            ContainerCli::with_runtime("false"),
            HubSettings::default(),
            Arc::new(InstanceStore::new(data_dir)),
            HostPathResolver::identity(),
        )
    }

    #[test]
    fn test_presence_drives_running_and_crashed() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator_without_runtime(dir.path());
        orch.set_state("yeelight", "yeelight_a1b2c3", LifecycleState::Initializing);

        // Seul le statut retained `online` fait passer en Running.
        orch.on_presence("yeelight_a1b2c3", Presence::Online);
        assert_eq!(orch.state_of("yeelight_a1b2c3"), Some(LifecycleState::Running));

        // Offline inattendu (last-will) pendant Running = crash.
        orch.on_presence("yeelight_a1b2c3", Presence::Offline);
        assert_eq!(orch.state_of("yeelight_a1b2c3"), Some(LifecycleState::Crashed));

        // Le retour du worker après relance le remet en Running.
        orch.on_presence("yeelight_a1b2c3", Presence::Online);
        assert_eq!(orch.state_of("yeelight_a1b2c3"), Some(LifecycleState::Running));
    }

    #[test]
    fn test_presence_ignores_idle_and_unknown_instances() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator_without_runtime(dir.path());

        // Un statut retained attardé ne relance pas une instance arrêtée.
        orch.set_state("yeelight", "stopped_1", LifecycleState::Stopped);
        orch.on_presence("stopped_1", Presence::Online);
        assert_eq!(orch.state_of("stopped_1"), Some(LifecycleState::Stopped));

        // Offline avant Running : l'unité démarre encore, pas un crash.
        orch.set_state("yeelight", "booting_1", LifecycleState::Initializing);
        orch.on_presence("booting_1", Presence::Offline);
        assert_eq!(orch.state_of("booting_1"), Some(LifecycleState::Initializing));

        orch.on_presence("ghost_1", Presence::Online);
        assert_eq!(orch.state_of("ghost_1"), None);
    }

    #[tokio::test]
    async fn test_remove_records_terminal_state() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator_without_runtime(dir.path());
        orch.set_state("yeelight", "yeelight_a1b2c3", LifecycleState::Stopped);

        orch.remove("yeelight", "yeelight_a1b2c3", false).await.unwrap();
        assert_eq!(orch.state_of("yeelight_a1b2c3"), Some(LifecycleState::Removed));
    }

    #[test]
    fn test_mode_from_config() {
        let mut cfg = sample_instance();
        cfg.config.insert("mode".to_string(), serde_json::json!("parasite"));
        let args = build_create_args(
            &HubSettings::default(),
            &HostPathResolver::identity(),
            &sample_recipe(),
            &cfg,
            std::path::Path::new("x.json"),
        );
        assert!(args.contains(&"TRELLIS_MODE=parasite".to_string()));
    }
}
