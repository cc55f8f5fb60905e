//! Résolution des chemins hôte pour les montages.
//!
//! Le hub peut lui-même tourner dans une unité d'isolation : les chemins
//! qu'il voit (ex. `./data` monté depuis l'hôte) ne sont pas ceux que le
//! démon conteneur attend dans un spec de montage. On relit donc la table
//! de montage du processus pour remapper, avec `TRELLIS_HOST_DATA_DIR` en
//! secours si l'introspection échoue, et l'identité hors conteneur.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct HostPathResolver {
    /// (chemin vu par le hub, chemin réel hôte), triés du plus long préfixe
    /// au plus court.
    mappings: Vec<(PathBuf, PathBuf)>,
}

impl HostPathResolver {
    /// Identité : le hub tourne directement sur l'hôte.
    pub fn identity() -> Self {
        Self { mappings: Vec::new() }
    }

    pub fn detect(data_dir: &Path) -> Self {
        if !Path::new("/.dockerenv").exists() && std::env::var("TRELLIS_IN_CONTAINER").is_err() {
            return Self::identity();
        }
        match std::fs::read_to_string("/proc/self/mountinfo") {
            Ok(content) => Self::from_mountinfo(&content),
            Err(e) => {
                warn!("introspection mountinfo impossible: {e}");
                match std::env::var("TRELLIS_HOST_DATA_DIR") {
                    Ok(host) => Self {
                        mappings: vec![(data_dir.to_path_buf(), PathBuf::from(host))],
                    },
                    Err(_) => {
                        warn!("TRELLIS_HOST_DATA_DIR absent, montages en chemins internes");
                        Self::identity()
                    }
                }
            }
        }
    }

    /// Construit la table depuis /proc/self/mountinfo. Pour un bind mount,
    /// le champ 4 (root) est le chemin hôte et le champ 5 le point de
    /// montage vu d'ici.
    pub fn from_mountinfo(content: &str) -> Self {
        let mut mappings = Vec::new();
        for line in content.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                continue;
            }
            let root = fields[3];
            let mount_point = fields[4];
            // Seuls les binds de répertoires hôte nous intéressent.
            if root == "/" || !root.starts_with('/') {
                continue;
            }
            mappings.push((PathBuf::from(mount_point), PathBuf::from(root)));
        }
        // Préfixe le plus long d'abord pour resolve().
        mappings.sort_by_key(|(mp, _)| std::cmp::Reverse(mp.as_os_str().len()));
        debug!("{} montages bind détectés", mappings.len());
        Self { mappings }
    }

    /// Remappe un chemin interne vers son chemin hôte.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        for (mount_point, host_root) in &self.mappings {
            if let Ok(rest) = path.strip_prefix(mount_point) {
                return host_root.join(rest);
            }
        }
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
22 28 0:20 / /sys rw,nosuid shared:7 - sysfs sysfs rw
28 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
455 28 8:1 /srv/trellis/data /app/data rw,relatime shared:1 - ext4 /dev/sda1 rw
456 28 8:1 /srv/trellis/data/connectors /app/data/connectors rw shared:1 - ext4 /dev/sda1 rw";

    #[test]
    fn test_bind_mount_remapping() {
        let r = HostPathResolver::from_mountinfo(MOUNTINFO);
        assert_eq!(
            r.resolve(Path::new("/app/data/settings.yaml")),
            PathBuf::from("/srv/trellis/data/settings.yaml")
        );
        // Préfixe le plus long gagnant
        assert_eq!(
            r.resolve(Path::new("/app/data/connectors/yeelight/a1.json")),
            PathBuf::from("/srv/trellis/data/connectors/yeelight/a1.json")
        );
    }

    #[test]
    fn test_unmapped_path_is_identity() {
        let r = HostPathResolver::from_mountinfo(MOUNTINFO);
        assert_eq!(r.resolve(Path::new("/etc/hosts")), PathBuf::from("/etc/hosts"));
        let id = HostPathResolver::identity();
        assert_eq!(id.resolve(Path::new("/app/data")), PathBuf::from("/app/data"));
    }
}
