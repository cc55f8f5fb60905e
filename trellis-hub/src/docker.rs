//! Pilotage du runtime conteneur (docker ou podman) via sa CLI.
//!
//! Toutes les opérations passent par des sous-processus : pas de dépendance
//! au daemon API. Les échecs remontent en `HubError::Runtime` avec le stderr.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::HubError;
use crate::logs::{parse_log_line, LogLine};

#[derive(Debug, Clone)]
pub struct ContainerCli {
    runtime: String,
}

/// État instantané d'un conteneur (`docker inspect`).
#[derive(Debug, Clone)]
pub struct ContainerState {
    pub status: String,
    pub restart_count: u32,
}

/// Entrée de `docker ps` filtrée sur nos labels.
#[derive(Debug, Clone)]
pub struct PsEntry {
    pub name: String,
    pub image: String,
    pub state: String,
    pub connector_type: String,
    pub instance_id: String,
}

impl ContainerCli {
    /// Détecte docker puis podman, comme le fait l'outillage conteneur
    /// du reste de l'écosystème.
    pub async fn detect() -> Result<Self, HubError> {
        for runtime in ["docker", "podman"] {
            let ok = Command::new(runtime)
                .arg("--version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map(|s| s.success())
                .unwrap_or(false);
            if ok {
                return Ok(Self { runtime: runtime.to_string() });
            }
        }
        Err(HubError::Runtime("no container runtime found (docker/podman)".to_string()))
    }

    pub fn with_runtime(runtime: impl Into<String>) -> Self {
        Self { runtime: runtime.into() }
    }

    async fn run(&self, args: &[String]) -> Result<String, HubError> {
        debug!("{} {}", self.runtime, args.join(" "));
        let output = Command::new(&self.runtime).args(args).output().await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(HubError::Runtime(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    pub async fn image_exists(&self, tag: &str) -> bool {
        self.run(&["image".into(), "inspect".into(), tag.into()]).await.is_ok()
    }

    /// Build avec timeout appelant : le process est tué à l'expiration.
    pub async fn build(
        &self,
        dockerfile: &Path,
        context: &Path,
        tag: &str,
        timeout: Duration,
    ) -> Result<(), HubError> {
        let mut child = Command::new(&self.runtime)
            .arg("build")
            .arg("-f")
            .arg(dockerfile)
            .arg("-t")
            .arg(tag)
            .arg(context)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Le drop du futur wait_with_output doit tuer le process :
            // un build expiré ne survit pas au timeout.
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(HubError::Timeout(format!("build of image '{tag}'")));
            }
        };
        if output.status.success() {
            Ok(())
        } else {
            Err(HubError::Runtime(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    pub async fn create(&self, args: Vec<String>) -> Result<(), HubError> {
        self.run(&args).await.map(|_| ())
    }

    pub async fn start(&self, name: &str) -> Result<(), HubError> {
        self.run(&["start".into(), name.into()]).await.map(|_| ())
    }

    /// Arrêt deux phases géré par le runtime : signal de terminaison, délai
    /// de grâce, puis kill forcé.
    pub async fn stop(&self, name: &str, grace_seconds: u64) -> Result<(), HubError> {
        self.run(&[
            "stop".into(),
            "-t".into(),
            grace_seconds.to_string(),
            name.into(),
        ])
        .await
        .map(|_| ())
    }

    pub async fn remove(&self, name: &str, force: bool) -> Result<(), HubError> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(name.to_string());
        self.run(&args).await.map(|_| ())
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.inspect_state(name).await.ok().flatten().is_some()
    }

    pub async fn inspect_state(&self, name: &str) -> Result<Option<ContainerState>, HubError> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}}\t{{.RestartCount}}".to_string(),
            name.to_string(),
        ];
        match self.run(&args).await {
            Ok(out) => {
                let mut parts = out.split('\t');
                let status = parts.next().unwrap_or("unknown").to_string();
                let restart_count = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                Ok(Some(ContainerState { status, restart_count }))
            }
            Err(HubError::Runtime(msg)) if msg.to_lowercase().contains("no such") => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Liste les conteneurs portant un label donné.
    pub async fn list(&self, label_filter: &str) -> Result<Vec<PsEntry>, HubError> {
        let format = "{{.Names}}\t{{.Image}}\t{{.State}}\t\
                      {{.Label \"trellis.connector\"}}\t{{.Label \"trellis.instance\"}}";
        let out = self
            .run(&[
                "ps".into(),
                "-a".into(),
                "--filter".into(),
                format!("label={label_filter}"),
                "--format".into(),
                format.into(),
            ])
            .await?;

        let mut entries = Vec::new();
        for line in out.lines().filter(|l| !l.trim().is_empty()) {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 5 {
                warn!("ligne ps inattendue: {line}");
                continue;
            }
            entries.push(PsEntry {
                name: fields[0].to_string(),
                image: fields[1].to_string(),
                state: fields[2].to_string(),
                connector_type: fields[3].to_string(),
                instance_id: fields[4].to_string(),
            });
        }
        Ok(entries)
    }

    /// Flux de logs classifiés. `follow` garde le process vivant ; il est
    /// tué quand le récepteur est lâché.
    pub fn stream_logs(
        &self,
        name: &str,
        tail: Option<u32>,
        since: Option<String>,
        follow: bool,
    ) -> Result<mpsc::Receiver<LogLine>, HubError> {
        let mut args: Vec<String> = vec!["logs".into(), "--timestamps".into()];
        if let Some(n) = tail {
            args.push("--tail".into());
            args.push(n.to_string());
        }
        if let Some(ts) = since {
            args.push("--since".into());
            args.push(ts);
        }
        if follow {
            args.push("-f".into());
        }
        args.push(name.to_string());

        let mut child = Command::new(&self.runtime)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let (tx, rx) = mpsc::channel::<LogLine>(256);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Les workers loggent souvent sur stderr : même traitement.
        if let Some(out) = stdout {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(parse_log_line(&line)).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(err) = stderr {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(parse_log_line(&line)).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Tue le process `logs -f` quand le récepteur est lâché.
        tokio::spawn(async move {
            loop {
                if tx.is_closed() {
                    let _ = child.kill().await;
                    break;
                }
                match tokio::time::timeout(Duration::from_millis(500), child.wait()).await {
                    Ok(_) => break,
                    Err(_) => continue,
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    // Le runtime est un binaire factice qui note son PID puis dort : tout
    // ce qu'on vérifie ici, c'est le contrat d'abandon du build.
    #[tokio::test]
    async fn test_build_timeout_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = dir.path().join("fake-runtime");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho $$ > {}\nexec sleep 20\n", pid_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let cli = ContainerCli::with_runtime(script.to_string_lossy().to_string());
        let res = cli
            .build(
                &dir.path().join("Dockerfile"),
                dir.path(),
                "trellis-connector-test:latest",
                Duration::from_millis(200),
            )
            .await;
        assert!(matches!(res, Err(HubError::Timeout(_))));

        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let mut alive = true;
        for _ in 0..20 {
            match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                // Encore vivant (pas zombie) : on laisse au kill le temps d'agir
                Ok(stat) if !stat.contains(") Z ") => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                _ => {
                    alive = false;
                    break;
                }
            }
        }
        assert!(!alive, "build process survived the timeout");
    }
}
