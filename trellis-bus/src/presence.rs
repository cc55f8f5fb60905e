//! Protocole de présence.
//!
//! Le statut d'une instance est un message retained (`online`/`offline`,
//! QoS 1) sur son topic `status`. Le last-will porte `offline` et DOIT être
//! enregistré dans les options de connexion AVANT toute annonce `online` :
//! le broker le publie seul si la connexion tombe de manière inattendue.
//! L'arrêt propre publie `offline` explicitement, sans compter sur le
//! last-will (qui peut être retardé par le keepalive du broker).

use rumqttc::{LastWill, MqttOptions, QoS};
use std::time::Duration;

use crate::topics::TopicSpace;

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online,
    Offline,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Online => ONLINE,
            Presence::Offline => OFFLINE,
        }
    }

    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        match payload {
            b"online" => Some(Presence::Online),
            b"offline" => Some(Presence::Offline),
            _ => None,
        }
    }
}

/// Last-will d'une instance : `offline` retained sur son topic status.
pub fn last_will(topics: &TopicSpace) -> LastWill {
    LastWill::new(topics.status(), OFFLINE, QoS::AtLeastOnce, true)
}

/// Options MQTT d'un worker, last-will pré-enregistré.
pub fn mqtt_options(client_id: &str, host: &str, port: u16, topics: &TopicSpace) -> MqttOptions {
    let mut opts = MqttOptions::new(client_id, host, port);
    opts.set_keep_alive(Duration::from_secs(15));
    opts.set_clean_session(true);
    opts.set_last_will(last_will(topics));
    opts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_payloads() {
        assert_eq!(Presence::from_payload(b"online"), Some(Presence::Online));
        assert_eq!(Presence::from_payload(b"offline"), Some(Presence::Offline));
        assert_eq!(Presence::from_payload(b"degraded"), None);
        assert_eq!(Presence::Online.as_str(), "online");
    }
}
