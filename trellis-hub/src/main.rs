/**
 * TRELLIS HUB - Point d'entrée de l'orchestrateur central
 *
 * RÔLE : Bootstrap des modules : config, store, runtime conteneur,
 * écoute bus, surveillance crash, API REST.
 *
 * ARCHITECTURE : Instances persistées en fichiers JSON, unités d'isolation
 * pilotées par la CLI du runtime, cycle de vie confirmé par les topics
 * status retained du bus.
 */

mod config;
mod connectors;
mod docker;
mod error;
mod http;
mod logs;
mod models;
mod mounts;
mod mqtt;
mod orchestrator;
mod store;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::docker::ContainerCli;
use crate::http::AppState;
use crate::models::{new_state, StatusMap};
use crate::mounts::HostPathResolver;
use crate::orchestrator::Orchestrator;
use crate::store::InstanceStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let settings = config::load_settings().await;
    info!("hub démarré, base topic '{}'", settings.base_topic);

    tokio::fs::create_dir_all(&settings.data_dir).await?;
    tokio::fs::create_dir_all(&settings.connectors_dir).await?;

    let cli = match ContainerCli::detect().await {
        Ok(cli) => cli,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let store = Arc::new(InstanceStore::new(&settings.data_dir));
    let resolver = HostPathResolver::detect(&settings.data_dir);
    let orchestrator = Arc::new(Orchestrator::new(
        cli,
        settings.clone(),
        store.clone(),
        resolver,
    ));
    let statuses = new_state::<StatusMap>(HashMap::new());

    // Le bus confirme Running ; le moniteur borne les boucles de crash
    mqtt::spawn_status_listener(settings.clone(), statuses.clone(), orchestrator.clone());
    orchestrator::spawn_crash_monitor(orchestrator.clone());

    let app_state = AppState {
        store,
        orchestrator,
        statuses,
        settings: settings.clone(),
    };
    let app = http::build_router(app_state);

    info!("API sur http://{}", settings.api_bind);
    let listener = TcpListener::bind(&settings.api_bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
