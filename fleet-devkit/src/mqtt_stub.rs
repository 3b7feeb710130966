/*!
Broker MQTT en mémoire pour tests sans Mosquitto

Implémente `fleet_proto::Publisher` : le kernel et les agents publient dessus
comme sur un `rumqttc::AsyncClient`. Garde le journal des publications,
injecte des échecs ou une latence, et appelle un hook à chaque publication
(ex: jouer le rôle du kernel en répondant par un ack).
*/

use anyhow::Result;
use async_trait::async_trait;
use fleet_proto::{topics, Ack, HeartbeatRecord, Publisher, TransportError, WorkloadCommand};
use parking_lot::Mutex;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

type PublishHook = Arc<dyn Fn(&MockMessage) + Send + Sync>;

/// Client partagé : les clones voient le même journal
#[derive(Clone, Default)]
pub struct MockMqttClient {
    published: Arc<Mutex<Vec<MockMessage>>>,
    should_fail: Arc<AtomicBool>,
    publish_delay: Arc<Mutex<Option<Duration>>>,
    hook: Arc<Mutex<Option<PublishHook>>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toute publication échoue tant que le flag est posé
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    /// Latence simulée avant chaque publication
    pub fn set_publish_delay(&self, delay: Duration) {
        *self.publish_delay.lock() = Some(delay);
    }

    /// Hook appelé après chaque publication réussie
    pub fn on_publish<F>(&self, hook: F)
    where
        F: Fn(&MockMessage) + Send + Sync + 'static,
    {
        *self.hook.lock() = Some(Arc::new(hook));
    }

    async fn record(&self, topic: String, qos: QoS, payload: Vec<u8>) -> Result<(), TransportError> {
        let delay = *self.publish_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.should_fail.load(Ordering::SeqCst) {
            log::warn!("📤 [MOCK] Publish to {} refused (failure injected)", topic);
            return Err(TransportError::Unavailable(format!("mock refused publish to {}", topic)));
        }

        let message = MockMessage { topic, payload, qos };
        self.published.lock().push(message.clone());
        log::debug!("📤 [MOCK] Published to {}: {} bytes", message.topic, message.payload.len());

        // hors du verrou : le hook peut republier
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(&message);
        }
        Ok(())
    }

    /// Journal complet, dans l'ordre de publication
    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published.lock().iter().filter(|m| m.topic == topic).cloned().collect()
    }

    /// Messages dont le topic commence par `prefix` (ex: "data/")
    pub fn find_messages_by_prefix(&self, prefix: &str) -> Vec<MockMessage> {
        self.published.lock().iter().filter(|m| m.topic.starts_with(prefix)).cloned().collect()
    }

    /// Dernier message d'un topic, parsé en JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.payload)?)),
            None => Ok(None),
        }
    }

    /// Heartbeats publiés par les agents
    pub fn heartbeats(&self) -> Vec<HeartbeatRecord> {
        self.find_messages_by_topic(topics::HEARTBEAT_TOPIC)
            .iter()
            .filter_map(|m| HeartbeatRecord::from_slice(&m.payload).ok())
            .collect()
    }

    /// Acks publiés sur `ctl/<agent>`
    pub fn acks_for(&self, agent: &str) -> Vec<Ack> {
        self.find_messages_by_topic(&topics::ctl_topic(agent))
            .iter()
            .filter_map(|m| Ack::from_slice(&m.payload).ok())
            .collect()
    }

    /// Commandes workload publiées sur `data/<agent>`
    pub fn commands_for(&self, agent: &str) -> Vec<WorkloadCommand> {
        self.find_messages_by_topic(&topics::data_topic(agent))
            .iter()
            .filter_map(|m| WorkloadCommand::from_slice(&m.payload).ok())
            .collect()
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

#[async_trait]
impl Publisher for MockMqttClient {
    async fn publish_bytes(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), TransportError> {
        self.record(topic.to_string(), qos, payload).await
    }
}
