/*!
Client bus mock pour développement sans broker

Permet de développer et tester des connecteurs sans broker MQTT réel.
Implémente [`trellis_bus::BusClient`] : le runtime worker l'accepte
partout où il accepterait un vrai client. Enregistre toutes les
publications et abonnements pour les assertions de tests.
*/

use anyhow::Result;
use async_trait::async_trait;
use rumqttc::QoS;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use trellis_bus::{BusClient, BusError};

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Client bus mock, clonable librement (état partagé).
#[derive(Clone, Default)]
pub struct MockBusClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
}

impl MockBusClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Récupère tous les messages publiés (pour assertions de tests)
    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap().clone()
    }

    /// Récupère les abonnements (pour assertions de tests)
    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Trouve les messages publiés sur un topic donné
    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parse le dernier message d'un topic en JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let messages = self.find_messages_by_topic(topic);
        if let Some(last_msg) = messages.last() {
            let parsed: T = serde_json::from_slice(&last_msg.payload)?;
            Ok(Some(parsed))
        } else {
            Ok(None)
        }
    }

    /// Dernier payload brut d'un topic (pour les messages non JSON,
    /// comme la présence `online`/`offline`)
    pub fn get_last_raw_message(&self, topic: &str) -> Option<Vec<u8>> {
        self.find_messages_by_topic(topic).last().map(|m| m.payload.clone())
    }

    /// Reset tous les messages enregistrés
    pub fn clear(&self) {
        self.published_messages.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
    }
}

#[async_trait]
impl BusClient for MockBusClient {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        let message = MockMessage { topic: topic.to_string(), payload, qos, retain };
        log::info!("[MOCK] publish {} ({} octets)", message.topic, message.payload.len());
        self.published_messages.lock().unwrap().push(message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), BusError> {
        log::info!("[MOCK] subscribe {topic}");
        self.subscriptions.lock().unwrap().push(topic.to_string());
        Ok(())
    }
}

/// Fabrique de messages conformes au contrat filaire, pour les tests.
pub struct WireMessageBuilder;

impl WireMessageBuilder {
    /// Commande datée de maintenant (fraîche).
    pub fn command(id: &str, values: Value) -> Value {
        Self::command_aged(id, values, 0)
    }

    /// Commande antidatée de `age_seconds` (pour tester la péremption).
    pub fn command_aged(id: &str, values: Value, age_seconds: i64) -> Value {
        let ts = OffsetDateTime::now_utc() - Duration::seconds(age_seconds);
        json!({
            "id": id,
            "timestamp": ts.format(&Rfc3339).unwrap(),
            "values": values.as_object().cloned().unwrap_or_else(Map::new),
        })
    }

    /// Snapshot d'état d'un device parent (pour nourrir un parasite).
    pub fn state_update(device_id: &str, state: Value) -> Value {
        json!({
            "timestamp": OffsetDateTime::now_utc().format(&Rfc3339).unwrap(),
            "device_id": device_id,
            "state": state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_client_publish_subscribe() {
        let client = MockBusClient::new();

        client.subscribe("test/topic", QoS::AtLeastOnce).await.unwrap();
        assert_eq!(client.get_subscriptions(), vec!["test/topic"]);

        let payload = b"test message";
        client.publish("test/topic", QoS::AtLeastOnce, true, payload.to_vec()).await.unwrap();

        let messages = client.get_published_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "test/topic");
        assert_eq!(messages[0].payload, payload);
        assert!(messages[0].retain);
    }

    #[tokio::test]
    async fn test_json_message_parsing() {
        let client = MockBusClient::new();
        let data = json!({"power": true, "brightness": 42});
        client
            .publish("json/topic", QoS::AtLeastOnce, false, serde_json::to_vec(&data).unwrap())
            .await
            .unwrap();

        let parsed: Option<Value> = client.get_last_json_message("json/topic").unwrap();
        assert_eq!(parsed.unwrap()["power"], json!(true));
    }

    #[test]
    fn test_command_builder_ages() {
        let fresh = WireMessageBuilder::command("c1", json!({"power": true}));
        assert_eq!(fresh["id"], "c1");
        assert_eq!(fresh["values"]["power"], json!(true));

        let stale = WireMessageBuilder::command_aged("c2", json!({}), 120);
        let ts = OffsetDateTime::parse(stale["timestamp"].as_str().unwrap(), &Rfc3339).unwrap();
        assert!(OffsetDateTime::now_utc() - ts >= Duration::seconds(119));
    }
}
