//! Catalogue des paquets connecteurs.
//!
//! Un paquet vit sous `{connectors_dir}/{connector_type}/` avec un manifest
//! `connector.json` optionnel. Sans manifest (ou sans recette déclarée), une
//! recette minimale est synthétisée : plusieurs instances d'un même type
//! partagent ainsi une seule image.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::error::HubError;

/// Manifest d'un paquet connecteur, `{type}/connector.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorManifest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Image préconstruite : court-circuite tout build.
    #[serde(default)]
    pub image: Option<String>,
    /// Dockerfile déclaré, relatif au dossier du paquet.
    #[serde(default)]
    pub dockerfile: Option<PathBuf>,
    /// Le connecteur a besoin de découverte broadcast/multicast :
    /// l'unité est lancée en réseau hôte partagé.
    #[serde(default)]
    pub host_network: bool,
}

impl ConnectorManifest {
    fn synthesized(connector_type: &str) -> Self {
        Self {
            name: connector_type.to_string(),
            description: None,
            image: None,
            dockerfile: None,
            host_network: false,
        }
    }
}

/// Recette résolue : un tag d'image, et un build à faire si l'image manque.
#[derive(Debug, Clone)]
pub struct BuildRecipe {
    pub image_tag: String,
    pub host_network: bool,
    /// (dockerfile, contexte) si l'image doit être construite localement.
    pub build: Option<(PathBuf, PathBuf)>,
}

/// Tag d'image d'un type de connecteur. Fonction pure : une image par type.
pub fn image_tag(connector_type: &str) -> String {
    format!("trellis-connector-{connector_type}:latest")
}

/// Dockerfile minimal synthétisé quand le paquet n'en déclare pas.
pub fn synthesized_dockerfile() -> String {
    [
        "FROM alpine:3.20",
        "RUN adduser -D -H trellis",
        "COPY . /opt/connector",
        "USER trellis",
        "ENTRYPOINT [\"/opt/connector/run\"]",
    ]
    .join("\n")
}

pub struct ConnectorCatalog {
    connectors_dir: PathBuf,
}

impl ConnectorCatalog {
    pub fn new<P: AsRef<Path>>(connectors_dir: P) -> Self {
        Self { connectors_dir: connectors_dir.as_ref().to_path_buf() }
    }

    pub fn package_dir(&self, connector_type: &str) -> PathBuf {
        self.connectors_dir.join(connector_type)
    }

    pub async fn manifest(&self, connector_type: &str) -> Result<ConnectorManifest, HubError> {
        let path = self.package_dir(connector_type).join("connector.json");
        if !path.exists() {
            debug!("pas de manifest pour '{connector_type}', recette synthétisée");
            return Ok(ConnectorManifest::synthesized(connector_type));
        }
        let content = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Résout la recette de build d'un type de connecteur.
    pub async fn resolve_recipe(&self, connector_type: &str) -> Result<BuildRecipe, HubError> {
        let manifest = self.manifest(connector_type).await?;
        let package_dir = self.package_dir(connector_type);

        if let Some(image) = manifest.image {
            return Ok(BuildRecipe {
                image_tag: image,
                host_network: manifest.host_network,
                build: None,
            });
        }

        let dockerfile = match manifest.dockerfile {
            Some(rel) => package_dir.join(rel),
            None => {
                let declared = package_dir.join("Dockerfile");
                if declared.exists() {
                    declared
                } else {
                    // Synthèse : écrite dans le paquet pour rester inspectable.
                    let generated = package_dir.join("Dockerfile.generated");
                    fs::create_dir_all(&package_dir).await?;
                    fs::write(&generated, synthesized_dockerfile()).await?;
                    generated
                }
            }
        };

        Ok(BuildRecipe {
            image_tag: image_tag(connector_type),
            host_network: manifest.host_network,
            build: Some((dockerfile, package_dir)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_tag_is_pure() {
        assert_eq!(image_tag("yeelight"), "trellis-connector-yeelight:latest");
        assert_eq!(image_tag("yeelight"), image_tag("yeelight"));
    }

    #[tokio::test]
    async fn test_missing_manifest_synthesizes() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = ConnectorCatalog::new(dir.path());
        let recipe = catalog.resolve_recipe("yeelight").await.unwrap();
        assert_eq!(recipe.image_tag, "trellis-connector-yeelight:latest");
        assert!(!recipe.host_network);
        let (dockerfile, _) = recipe.build.unwrap();
        assert!(dockerfile.ends_with("Dockerfile.generated"));
        assert!(dockerfile.exists());
    }

    #[tokio::test]
    async fn test_declared_image_skips_build() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("wled");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(
            pkg.join("connector.json"),
            r#"{"name": "wled", "image": "ghcr.io/acme/wled:1.2", "host_network": true}"#,
        )
        .unwrap();

        let catalog = ConnectorCatalog::new(dir.path());
        let recipe = catalog.resolve_recipe("wled").await.unwrap();
        assert_eq!(recipe.image_tag, "ghcr.io/acme/wled:1.2");
        assert!(recipe.host_network);
        assert!(recipe.build.is_none());
    }
}
