//! Flux de logs d'une unité : {timestamp, level, content}.
//!
//! La sévérité est déduite par inspection légère du contenu. C'est purement
//! indicatif (affichage, filtrage) : jamais utilisé pour une décision de
//! contrôle.

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub level: LogLevel,
    pub content: String,
}

pub fn classify_level(content: &str) -> LogLevel {
    let lower = content.to_lowercase();
    if lower.contains("error") || lower.contains("exception") || lower.contains("traceback") {
        LogLevel::Error
    } else if lower.contains("warning") || lower.contains("warn") {
        LogLevel::Warning
    } else if lower.contains("success") || lower.contains("connected") || lower.contains("online") {
        LogLevel::Success
    } else {
        LogLevel::Info
    }
}

/// Découpe une ligne `docker logs --timestamps` (préfixe RFC3339 + espace).
pub fn parse_log_line(raw: &str) -> LogLine {
    if let Some((prefix, rest)) = raw.split_once(' ') {
        if OffsetDateTime::parse(prefix, &Rfc3339).is_ok() {
            return LogLine {
                timestamp: Some(prefix.to_string()),
                level: classify_level(rest),
                content: rest.to_string(),
            };
        }
    }
    LogLine {
        timestamp: None,
        level: classify_level(raw),
        content: raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_heuristics() {
        assert_eq!(classify_level("connection refused ERROR"), LogLevel::Error);
        assert_eq!(classify_level("unhandled exception in poll loop"), LogLevel::Error);
        assert_eq!(classify_level("Warning: slow response"), LogLevel::Warning);
        assert_eq!(classify_level("worker online, 3 devices"), LogLevel::Success);
        assert_eq!(classify_level("polling light1"), LogLevel::Info);
    }

    #[test]
    fn test_timestamp_prefix_extraction() {
        let line = parse_log_line("2026-08-25T10:00:00.123456789Z worker online");
        assert_eq!(line.timestamp.as_deref(), Some("2026-08-25T10:00:00.123456789Z"));
        assert_eq!(line.level, LogLevel::Success);
        assert_eq!(line.content, "worker online");

        let bare = parse_log_line("no timestamp here");
        assert!(bare.timestamp.is_none());
        assert_eq!(bare.content, "no timestamp here");
    }
}
