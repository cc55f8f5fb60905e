/*!
Couche contrat du bus Trellis

Tout ce qu'un worker doit produire/consommer sur le bus passe par cette
crate : grammaire des topics, enveloppes de messages, règle de présence
(retained + last-will), rejet des commandes périmées, point d'extension
de normalisation des valeurs et types de la couche parasite.

La crate est indépendante du transport : le trait [`BusClient`] est la
seule surface que le runtime et le devkit implémentent.
*/

pub mod client;
pub mod envelope;
pub mod error;
pub mod normalize;
pub mod parasite;
pub mod presence;
pub mod topics;

pub use client::{publish_json, BusClient};
pub use envelope::{CmdResponse, Command, ErrorMessage, Event, ResponseStatus, Severity, StateUpdate};
pub use error::BusError;
pub use normalize::{ColorFormat, NormalizerSet, PercentBounds, RelativeDelta, ValueNormalizer};
pub use parasite::{validate_targets, ParasiteRegistration, ParasiteTarget};
pub use presence::{Presence, OFFLINE, ONLINE};
pub use topics::{parse_topic, Channel, ParsedTopic, TopicSpace, DEFAULT_BASE, PROTOCOL_VERSION};
