//! Connection supervisor: owns the MQTT session and routes bus traffic.
//!
//! Single place where rumqttc is driven. Incoming publishes are dispatched
//! to the runtime (commands) or the parasite layer (parent state); slow work
//! runs on spawned tasks so the event loop keeps servicing keepalives.
//! Termination signals trigger the graceful offline sequence.

use rumqttc::{AsyncClient, Event, Incoming, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use trellis_bus::{parse_topic, presence, ParsedTopic};

use crate::connector::ParasiteCompute;
use crate::parasite::ParasiteRuntime;
use crate::runtime::WorkerRuntime;

/// Consecutive event-loop failures tolerated before giving up. The unit's
/// restart policy takes over from there.
const ERROR_BUDGET: u32 = 30;

pub struct Supervisor {
    runtime: Arc<WorkerRuntime>,
    parasite: Option<(Arc<ParasiteRuntime>, Arc<dyn ParasiteCompute>)>,
}

impl Supervisor {
    pub fn new(runtime: Arc<WorkerRuntime>) -> Self {
        Self { runtime, parasite: None }
    }

    pub fn with_parasite(
        mut self,
        parasite: Arc<ParasiteRuntime>,
        compute: Arc<dyn ParasiteCompute>,
    ) -> Self {
        self.parasite = Some((parasite, compute));
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let config = self.runtime.config();
        let client_id = format!("trellis-worker-{}", config.instance_id);
        // Last-will registered before connect: the broker announces our
        // death even if we never get to say goodbye.
        let options = presence::mqtt_options(
            &client_id,
            &config.mqtt_host,
            config.mqtt_port,
            self.runtime.topics(),
        );
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        self.runtime.connector().start().await?;
        self.runtime.announce_online(&client).await?;

        if let Some((parasite, _)) = &self.parasite {
            for topic in parasite.subscriptions() {
                client.subscribe(topic, QoS::AtLeastOnce).await?;
            }
            parasite.register(&client).await?;
        }

        let mut poll_timer = interval(config.poll_interval);
        let base_topic = config.base_topic.clone();
        let own_instance = config.instance_id.clone();
        let mut consecutive_errors: u32 = 0;

        loop {
            tokio::select! {
                _ = poll_timer.tick() => {
                    let runtime = self.runtime.clone();
                    let client = client.clone();
                    tokio::spawn(async move {
                        if let Err(e) = runtime.poll_cycle(&client).await {
                            warn!("poll cycle failed: {e}");
                        }
                    });
                }

                _ = terminate_signal() => {
                    info!("termination signal received, going offline");
                    self.runtime.shutdown(&client).await?;
                    let _ = client.disconnect().await;
                    return Ok(());
                }

                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        consecutive_errors = 0;
                        self.dispatch(&client, &base_topic, &own_instance, &publish.topic, &publish.payload);
                    }
                    Ok(_) => {
                        consecutive_errors = 0;
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        if consecutive_errors >= ERROR_BUDGET {
                            error!("MQTT connection error budget exhausted: {e}");
                            anyhow::bail!("lost connection to broker");
                        }
                        warn!("MQTT connection error ({consecutive_errors}/{ERROR_BUDGET}): {e}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                },
            }
        }
    }

    fn dispatch(
        &self,
        client: &AsyncClient,
        base_topic: &str,
        own_instance: &str,
        topic: &str,
        payload: &[u8],
    ) {
        // Parent state topics belong to foreign instances and parse under
        // the same grammar, so the parasite layer gets first refusal.
        if let Some((parasite, compute)) = &self.parasite {
            if parasite.handle_parent_state(topic, payload) {
                let parasite = parasite.clone();
                let compute = compute.clone();
                let client = client.clone();
                tokio::spawn(async move {
                    if let Err(e) = parasite.compute_cycle(&client, compute.as_ref()).await {
                        warn!("parasite compute failed: {e}");
                    }
                });
                return;
            }
        }

        match parse_topic(base_topic, topic) {
            Ok(ParsedTopic::DeviceCmd { instance_id, device_id }) if instance_id == own_instance => {
                let runtime = self.runtime.clone();
                let client = client.clone();
                let payload = payload.to_vec();
                tokio::spawn(async move {
                    if let Err(e) = runtime.handle_command(&client, &device_id, &payload).await {
                        warn!("command handling failed on {device_id}: {e}");
                    }
                });
            }
            Ok(_) => debug!("ignoring message on {topic}"),
            Err(_) => debug!("foreign topic {topic}"),
        }
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
