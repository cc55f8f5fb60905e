//! Façade transport du bus.
//!
//! Le runtime worker et le hub ne manipulent jamais `rumqttc` directement :
//! ils passent par [`BusClient`], que le devkit implémente aussi avec un
//! client mock pour tester sans broker.

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;

use crate::error::BusError;

#[async_trait]
pub trait BusClient: Send + Sync {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<(), BusError>;
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BusError>;
}

#[async_trait]
impl BusClient for AsyncClient {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<(), BusError> {
        AsyncClient::publish(self, topic, qos, retain, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BusError> {
        AsyncClient::subscribe(self, topic, qos).await?;
        Ok(())
    }
}

/// Sérialise un message et le publie.
pub async fn publish_json<T: Serialize + Sync>(
    client: &dyn BusClient,
    topic: &str,
    qos: QoS,
    retain: bool,
    message: &T,
) -> Result<(), BusError> {
    let payload = serde_json::to_vec(message)?;
    client.publish(topic, qos, retain, payload).await
}
