//! Écoute du bus : topics status retained de toutes les instances.
//!
//! C'est la seule source de vérité pour Initializing→Running et pour la
//! détection de crash (last-will offline). Le runtime conteneur ne dit
//! jamais si le worker est réellement connecté au bus.

use rumqttc::{AsyncClient, Event, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{info, warn};
use trellis_bus::{parse_topic, ParsedTopic, Presence, TopicSpace};

use crate::config::HubSettings;
use crate::models::{InstanceStatus, Shared, StatusMap};
use crate::orchestrator::Orchestrator;

pub fn spawn_status_listener(
    settings: HubSettings,
    statuses: Shared<StatusMap>,
    orchestrator: Arc<Orchestrator>,
) {
    task::spawn(async move {
        let mut opts = MqttOptions::new("trellis-hub", &settings.mqtt.host, settings.mqtt.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 64);

        let sub = TopicSpace::status_subscription(&settings.base_topic);
        if let Err(e) = client.subscribe(&sub, QoS::AtLeastOnce).await {
            warn!("subscribe {sub} impossible: {e}");
            return;
        }
        info!("écoute statut sur {sub}");

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(rumqttc::Incoming::Publish(p))) => {
                    let parsed = match parse_topic(&settings.base_topic, &p.topic) {
                        Ok(parsed) => parsed,
                        Err(_) => continue,
                    };
                    let ParsedTopic::Status { instance_id } = parsed else {
                        continue;
                    };
                    let Some(presence) = Presence::from_payload(&p.payload) else {
                        warn!("payload status illisible sur {}", p.topic);
                        continue;
                    };
                    statuses
                        .lock()
                        .insert(instance_id.clone(), InstanceStatus::observed(&instance_id, presence));
                    orchestrator.on_presence(&instance_id, presence);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("erreur MQTT: {e:?}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}
