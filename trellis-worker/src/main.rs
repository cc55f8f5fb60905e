//! Trellis worker entry point.
//!
//! Reads its identity from the environment the hub injected, loads the
//! mounted instance definition, picks the connector implementation for
//! TRELLIS_CONNECTOR_TYPE and hands everything to the supervisor.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::info;

use trellis_worker::config::{WorkerConfig, WorkerMode};
use trellis_worker::parasite::ParasiteRuntime;
use trellis_worker::runtime::WorkerRuntime;
use trellis_worker::supervisor::Supervisor;
use trellis_worker::virtual_connector::VirtualConnector;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = WorkerConfig::load().await.context("failed to load worker config")?;
    info!(
        "starting worker for instance {} (connector {}, {} device(s))",
        config.instance_id,
        config.connector_type,
        config.instance.devices.len()
    );

    // Connector families ship with the worker image; the hub selects one
    // per instance through TRELLIS_CONNECTOR_TYPE.
    let connector = match config.connector_type.as_str() {
        "virtual" => Arc::new(VirtualConnector::new()),
        other => bail!("unknown connector type '{other}'"),
    };

    let mode = config.mode;
    let runtime = Arc::new(WorkerRuntime::new(config.clone(), Box::new(connector.clone())));

    let supervisor = match mode {
        WorkerMode::Normal => Supervisor::new(runtime),
        WorkerMode::Parasite => {
            let parasite = Arc::new(
                ParasiteRuntime::from_config(&config).context("invalid parasite configuration")?,
            );
            Supervisor::new(runtime).with_parasite(parasite, connector)
        }
    };

    supervisor.run().await
}
