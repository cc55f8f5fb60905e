/*!
Harness de test pour connecteurs Trellis

Facilite l'écriture de tests de runtime worker:
- Setup automatique du client bus mock
- Assertions sur les messages publiés par topic
- Statistiques sur le trafic collecté
*/

use crate::mqtt_stub::MockBusClient;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Harness de test autour d'un [`MockBusClient`].
pub struct TestHarness {
    pub bus: MockBusClient,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok();
        Self { bus: MockBusClient::new() }
    }

    /// Attend qu'un message JSON apparaisse sur un topic.
    pub async fn wait_for_message(&self, topic: &str, timeout_ms: u64) -> Result<Option<Value>> {
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if let Some(msg) = self.bus.get_last_json_message::<Value>(topic)? {
                return Ok(Some(msg));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        log::warn!("timeout en attente d'un message sur {topic}");
        Ok(None)
    }

    /// Assert qu'un message exact a été publié sur un topic.
    pub fn assert_message_sent(&self, topic: &str, expected_payload: &Value) -> Result<()> {
        for msg in self.bus.find_messages_by_topic(topic) {
            let payload: Value = serde_json::from_slice(&msg.payload)?;
            if payload == *expected_payload {
                return Ok(());
            }
        }
        anyhow::bail!("message attendu absent du topic {topic}");
    }

    /// Assert qu'un champ du dernier message a une valeur donnée
    /// (chemin pointé `a.b.c`).
    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        if let Some(msg) = self.bus.get_last_json_message::<Value>(topic)? {
            if let Some(actual) = get_nested_field(&msg, field_path) {
                if actual == expected {
                    return Ok(());
                }
                anyhow::bail!(
                    "champ '{field_path}' sur {topic}: attendu {expected:?}, obtenu {actual:?}"
                );
            }
        }
        anyhow::bail!("champ '{field_path}' introuvable dans le dernier message sur {topic}");
    }

    /// Assert qu'aucun message n'a été publié sur un topic. Les garanties
    /// du contrat sont souvent négatives (commande périmée = silence).
    pub fn assert_no_message(&self, topic: &str) -> Result<()> {
        let count = self.bus.find_messages_by_topic(topic).len();
        if count > 0 {
            anyhow::bail!("{count} message(s) inattendu(s) sur {topic}");
        }
        Ok(())
    }

    /// Stats sur les messages collectés
    pub fn get_stats(&self) -> TestStats {
        let messages = self.bus.get_published_messages();
        let mut topic_counts = HashMap::new();
        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }
        TestStats {
            total_messages: messages.len(),
            topic_counts,
            subscriptions: self.bus.get_subscriptions(),
        }
    }

    /// Reset le harness pour un nouveau test
    pub fn reset(&self) {
        self.bus.clear();
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
    pub subscriptions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::QoS;
    use trellis_bus::BusClient;

    #[tokio::test]
    async fn test_harness_assertions() {
        let harness = TestHarness::new();
        let data = serde_json::json!({"state": {"power": true}});
        harness
            .bus
            .publish("t/topic", QoS::AtLeastOnce, false, serde_json::to_vec(&data).unwrap())
            .await
            .unwrap();

        harness.assert_message_sent("t/topic", &data).unwrap();
        harness
            .assert_field_equals("t/topic", "state.power", &serde_json::Value::Bool(true))
            .unwrap();
        harness.assert_no_message("t/autre").unwrap();

        let stats = harness.get_stats();
        assert_eq!(stats.total_messages, 1);

        harness.reset();
        assert!(harness.bus.get_published_messages().is_empty());
    }
}
