//! Grammaire des topics du bus.
//!
//! Forme générale : `{base}/v1/instances/{instance_id}/devices/{device_id}/{channel}`
//! avec channel ∈ {state, state/{property}, cmd, cmd/response, error, events}.
//! Au niveau instance : `.../status` (présence retained) et `.../parasite`
//! (auto-déclaration des extensions). Les canaux groupes et meta suivent le
//! même motif, scopés `groups/{group_id}` et `meta`.

use crate::error::BusError;

pub const DEFAULT_BASE: &str = "trellis";
pub const PROTOCOL_VERSION: &str = "v1";

/// Canaux scopés device/groupe/meta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    State,
    Cmd,
    CmdResponse,
    Error,
    Events,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::State => "state",
            Channel::Cmd => "cmd",
            Channel::CmdResponse => "cmd/response",
            Channel::Error => "error",
            Channel::Events => "events",
        }
    }
}

/// Espace de topics d'une instance. Toutes les méthodes sont des fonctions
/// pures de (base, instance_id) : deux appels identiques produisent toujours
/// le même topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpace {
    base: String,
    instance_id: String,
}

impl TopicSpace {
    pub fn new(base: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn root(&self) -> String {
        format!("{}/{}/instances/{}", self.base, PROTOCOL_VERSION, self.instance_id)
    }

    /// Topic de présence (retained, online/offline).
    pub fn status(&self) -> String {
        format!("{}/status", self.root())
    }

    /// Topic d'auto-déclaration parasite de l'instance.
    pub fn parasite(&self) -> String {
        format!("{}/parasite", self.root())
    }

    /// Racine d'un device : `.../devices/{device_id}` (sans canal).
    pub fn device_root(&self, device_id: &str) -> String {
        format!("{}/devices/{}", self.root(), device_id)
    }

    pub fn device(&self, device_id: &str, channel: Channel) -> String {
        format!("{}/{}", self.device_root(device_id), channel.as_str())
    }

    /// Fan-out d'une propriété individuelle : `.../state/{property}`.
    pub fn device_property(&self, device_id: &str, property: &str) -> String {
        format!("{}/state/{}", self.device_root(device_id), property)
    }

    pub fn group(&self, group_id: &str, channel: Channel) -> String {
        format!("{}/groups/{}/{}", self.root(), group_id, channel.as_str())
    }

    pub fn meta(&self, channel: Channel) -> String {
        format!("{}/meta/{}", self.root(), channel.as_str())
    }

    /// Filtre d'abonnement au namespace de commandes de l'instance.
    pub fn cmd_subscription(&self) -> String {
        format!("{}/devices/+/cmd", self.root())
    }

    /// Filtre d'abonnement aux statuts de toutes les instances (côté hub).
    pub fn status_subscription(base: &str) -> String {
        format!("{}/{}/instances/+/status", base, PROTOCOL_VERSION)
    }
}

/// Topic entrant décomposé, pour le routage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTopic {
    Status { instance_id: String },
    Parasite { instance_id: String },
    DeviceState { instance_id: String, device_id: String },
    DeviceStateProperty { instance_id: String, device_id: String, property: String },
    DeviceCmd { instance_id: String, device_id: String },
    DeviceCmdResponse { instance_id: String, device_id: String },
    DeviceError { instance_id: String, device_id: String },
    DeviceEvents { instance_id: String, device_id: String },
    Group { instance_id: String, group_id: String, channel: String },
    Meta { instance_id: String, channel: String },
}

/// Décompose un topic du bus. Retourne une erreur pour tout topic hors
/// grammaire (base inconnue, version inconnue, segments manquants).
pub fn parse_topic(base: &str, topic: &str) -> Result<ParsedTopic, BusError> {
    let bad = || BusError::InvalidTopic(topic.to_string());
    let mut parts = topic.split('/');

    if parts.next() != Some(base) || parts.next() != Some(PROTOCOL_VERSION) {
        return Err(bad());
    }
    if parts.next() != Some("instances") {
        return Err(bad());
    }
    let instance_id = parts.next().filter(|s| !s.is_empty()).ok_or_else(bad)?.to_string();

    match parts.next() {
        Some("status") if parts.next().is_none() => Ok(ParsedTopic::Status { instance_id }),
        Some("parasite") if parts.next().is_none() => Ok(ParsedTopic::Parasite { instance_id }),
        Some("devices") => {
            let device_id = parts.next().filter(|s| !s.is_empty()).ok_or_else(bad)?.to_string();
            let channel = parts.next().ok_or_else(bad)?;
            let tail = parts.next();
            match (channel, tail) {
                ("state", None) => Ok(ParsedTopic::DeviceState { instance_id, device_id }),
                ("state", Some(property)) if parts.next().is_none() => {
                    Ok(ParsedTopic::DeviceStateProperty {
                        instance_id,
                        device_id,
                        property: property.to_string(),
                    })
                }
                ("cmd", None) => Ok(ParsedTopic::DeviceCmd { instance_id, device_id }),
                ("cmd", Some("response")) if parts.next().is_none() => {
                    Ok(ParsedTopic::DeviceCmdResponse { instance_id, device_id })
                }
                ("error", None) => Ok(ParsedTopic::DeviceError { instance_id, device_id }),
                ("events", None) => Ok(ParsedTopic::DeviceEvents { instance_id, device_id }),
                _ => Err(bad()),
            }
        }
        Some("groups") => {
            let group_id = parts.next().filter(|s| !s.is_empty()).ok_or_else(bad)?.to_string();
            let channel = parts.collect::<Vec<_>>().join("/");
            if channel.is_empty() {
                return Err(bad());
            }
            Ok(ParsedTopic::Group { instance_id, group_id, channel })
        }
        Some("meta") => {
            let channel = parts.collect::<Vec<_>>().join("/");
            if channel.is_empty() {
                return Err(bad());
            }
            Ok(ParsedTopic::Meta { instance_id, channel })
        }
        _ => Err(bad()),
    }
}
