//! Enveloppes de messages du bus.
//!
//! Les formes JSON sont la surface d'intégration : tout changement casse le
//! contrat et exige un bump de version dans le préfixe de topic.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Commande reçue sur `.../devices/{device_id}/cmd`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub values: Map<String, Value>,
    /// Timeout d'exécution en secondes.
    #[serde(rename = "timeout", skip_serializing_if = "Option::is_none", default)]
    pub timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub priority: Option<u8>,
}

impl Command {
    pub fn new(values: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: OffsetDateTime::now_utc(),
            values,
            timeout_seconds: None,
            priority: None,
        }
    }

    /// Une commande plus vieille que le seuil est rejetée en silence :
    /// pas de réponse, pas de mutation d'état. Protège contre la relivraison
    /// d'instructions obsolètes pendant les tempêtes de reconnexion.
    pub fn is_stale(&self, threshold: Duration, now: OffsetDateTime) -> bool {
        now - self.timestamp > threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
    Timeout,
}

/// Réponse corrélée publiée sur `cmd/response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdResponse {
    pub cmd_id: String,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl CmdResponse {
    pub fn success(cmd_id: impl Into<String>, result: Value) -> Self {
        Self {
            cmd_id: cmd_id.into(),
            status: ResponseStatus::Success,
            result: Some(result),
            error: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn error(cmd_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            cmd_id: cmd_id.into(),
            status: ResponseStatus::Error,
            result: None,
            error: Some(message.into()),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn timeout(cmd_id: impl Into<String>) -> Self {
        Self {
            cmd_id: cmd_id.into(),
            status: ResponseStatus::Timeout,
            result: None,
            error: Some("command execution timed out".to_string()),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Snapshot d'état complet publié (retained) sur `state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateUpdate {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub device_id: String,
    pub state: Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub link_quality: Option<u8>,
}

impl StateUpdate {
    pub fn new(device_id: impl Into<String>, state: Value) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            device_id: device_id.into(),
            state,
            link_quality: None,
        }
    }
}

/// Évènement ponctuel sur `events` (jamais retained).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub event: String,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Erreur structurée sur `error`. Notification transitoire : jamais retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub code: String,
    pub message: String,
    pub severity: Severity,
}

impl ErrorMessage {
    pub fn new(code: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            code: code.into(),
            message: message.into(),
            severity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_shape() {
        let raw = r#"{"id":"c1","timestamp":"2026-08-25T10:00:00Z","values":{"power":true},"timeout":5}"#;
        let cmd: Command = serde_json::from_str(raw).unwrap();
        assert_eq!(cmd.id, "c1");
        assert_eq!(cmd.values.get("power"), Some(&json!(true)));
        assert_eq!(cmd.timeout_seconds, Some(5));
        assert_eq!(cmd.priority, None);
    }

    #[test]
    fn test_staleness_threshold() {
        let now = OffsetDateTime::now_utc();
        let mut cmd = Command::new(Map::new());
        cmd.timestamp = now - Duration::seconds(35);
        assert!(cmd.is_stale(Duration::seconds(30), now));
        cmd.timestamp = now - Duration::seconds(5);
        assert!(!cmd.is_stale(Duration::seconds(30), now));
    }

    #[test]
    fn test_response_omits_empty_fields() {
        let resp = CmdResponse::success("c1", json!({"power": true}));
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["cmd_id"], "c1");
        assert_eq!(v["status"], "success");
        assert!(v.get("error").is_none());

        let err = CmdResponse::error("c2", "nope");
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["status"], "error");
        assert!(v.get("result").is_none());
    }

    #[test]
    fn test_severity_serializes_lowercase() {
        let e = ErrorMessage::new("device_unreachable", "no answer from lamp", Severity::Warning);
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["severity"], "warning");
        assert_eq!(v["code"], "device_unreachable");
    }
}
