//! Types de la couche parasite.
//!
//! Un worker B peut étendre le namespace d'état d'un device publié par un
//! worker A sans que A change ni que B le contrôle. B publie uniquement sur
//! des sous-chemins `{parent}/state/{field}` et reste commandé via son
//! propre namespace. L'égalité de `device_id` entre l'entrée device de B et
//! le device parent est la seule clé de corrélation : elle est obligatoire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::error::BusError;

/// Cible d'extension configurée côté parasite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParasiteTarget {
    /// Racine du device parent, ex. `trellis/v1/instances/cam_1/devices/camera_1`.
    pub parent_path: String,
    pub parent_device_id: String,
    pub parent_instance_id: String,
    /// Attributs du parent capturés au setup (snapshot figé).
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl ParasiteTarget {
    /// Topic d'état complet du parent (abonnement lecture seule).
    pub fn state_topic(&self) -> String {
        format!("{}/state", self.parent_path)
    }

    /// Topic d'un champ étendu. Refuse tout ce qui sortirait du sous-espace
    /// `state/{field}` : champ vide, séparateur, ou tentative d'écrire la
    /// racine `state` ou un canal de commande du parent.
    pub fn field_topic(&self, field: &str) -> Result<String, BusError> {
        if field.is_empty() || field.contains('/') || field.contains('+') || field.contains('#') {
            return Err(BusError::InvalidTopic(format!(
                "parasite field must be a plain segment, got '{field}'"
            )));
        }
        Ok(format!("{}/state/{}", self.parent_path, field))
    }

    /// Profondeur de chaînage déclarée (1 = parasite d'un worker normal).
    pub fn chain_depth(&self) -> u64 {
        self.attributes.get("chain_depth").and_then(Value::as_u64).unwrap_or(1)
    }
}

/// Auto-déclaration publiée (retained) sur le topic `parasite` de l'instance,
/// pour que l'outillage externe reconstruise le graphe d'extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParasiteRegistration {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub targets: Vec<String>,
}

impl ParasiteRegistration {
    pub fn new(targets: &[ParasiteTarget]) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            targets: targets.iter().map(|t| t.parent_path.clone()).collect(),
        }
    }
}

/// Valide une liste de cibles au démarrage du worker.
///
/// Garde-fous contre les chaînages pathologiques (question ouverte du design
/// d'origine, tranchée ici) : une cible pointant sur sa propre instance est
/// un cycle trivial et est rejetée ; la profondeur de chaîne déclarée est
/// bornée par `max_chain_depth`.
pub fn validate_targets(
    own_instance_id: &str,
    targets: &[ParasiteTarget],
    max_chain_depth: u64,
) -> Result<(), BusError> {
    for target in targets {
        if target.parent_instance_id == own_instance_id {
            return Err(BusError::ParasiteTarget(format!(
                "target '{}' points back to own instance '{}'",
                target.parent_path, own_instance_id
            )));
        }
        if target.chain_depth() > max_chain_depth {
            return Err(BusError::ParasiteTarget(format!(
                "target '{}' exceeds max chain depth {} (declared {})",
                target.parent_path,
                max_chain_depth,
                target.chain_depth()
            )));
        }
        if target.parent_device_id.is_empty() {
            return Err(BusError::ParasiteTarget(format!(
                "target '{}' has an empty parent_device_id",
                target.parent_path
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target(parent_instance: &str) -> ParasiteTarget {
        ParasiteTarget {
            parent_path: format!("trellis/v1/instances/{parent_instance}/devices/camera_1"),
            parent_device_id: "camera_1".to_string(),
            parent_instance_id: parent_instance.to_string(),
            attributes: Map::new(),
        }
    }

    #[test]
    fn test_field_topic_stays_under_state() {
        let t = target("cam_1");
        assert_eq!(
            t.field_topic("motion").unwrap(),
            "trellis/v1/instances/cam_1/devices/camera_1/state/motion"
        );
        assert!(t.field_topic("").is_err());
        assert!(t.field_topic("a/b").is_err());
        assert!(t.field_topic("#").is_err());
    }

    #[test]
    fn test_self_cycle_rejected() {
        let t = target("motion_9");
        assert!(validate_targets("motion_9", &[t], 3).is_err());
    }

    #[test]
    fn test_chain_depth_bounded() {
        let mut t = target("cam_1");
        t.attributes.insert("chain_depth".to_string(), json!(4));
        assert!(validate_targets("motion_9", &[t.clone()], 3).is_err());
        t.attributes.insert("chain_depth".to_string(), json!(2));
        assert!(validate_targets("motion_9", &[t], 3).is_ok());
    }

    #[test]
    fn test_registration_lists_parent_paths() {
        let reg = ParasiteRegistration::new(&[target("cam_1"), target("cam_2")]);
        assert_eq!(
            reg.targets,
            vec![
                "trellis/v1/instances/cam_1/devices/camera_1",
                "trellis/v1/instances/cam_2/devices/camera_1"
            ]
        );
    }
}
