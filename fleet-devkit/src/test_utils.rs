/*!
Test Harness pour le kernel et les agents

Les publications du kernel passent par les workers du dispatcher : les
assertions doivent attendre. Le harness fournit une attente active bornée,
brute (JSON) ou typée (acks, commandes workload).
*/

use crate::mqtt_stub::MockMqttClient;
use anyhow::Result;
use fleet_proto::{topics, Ack, WorkloadCommand};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

const POLL_STEP: Duration = Duration::from_millis(10);

pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok();
        Self { mqtt_client: MockMqttClient::new() }
    }

    /// Attend jusqu'à ce que `ready` soit vrai ou que le délai expire
    async fn poll_until<F: Fn(&MockMqttClient) -> bool>(&self, timeout_ms: u64, ready: F) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if ready(&self.mqtt_client) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_STEP).await;
        }
    }

    /// Attend au moins `count` messages sur un topic ; renvoie ce qui a été vu
    pub async fn wait_for_messages(&self, topic: &str, count: usize, timeout_ms: u64) -> Result<Vec<Value>> {
        if !self.poll_until(timeout_ms, |m| m.find_messages_by_topic(topic).len() >= count).await {
            log::warn!("⏰ Timeout waiting for {} message(s) on {}", count, topic);
        }
        self.mqtt_client
            .find_messages_by_topic(topic)
            .iter()
            .map(|m| serde_json::from_slice(&m.payload).map_err(Into::into))
            .collect()
    }

    pub async fn wait_for_message(&self, topic: &str, timeout_ms: u64) -> Result<Option<Value>> {
        Ok(self.wait_for_messages(topic, 1, timeout_ms).await?.into_iter().last())
    }

    /// Premier ack publié sur `ctl/<agent>`
    pub async fn wait_for_ack(&self, agent: &str, timeout_ms: u64) -> Option<Ack> {
        self.poll_until(timeout_ms, |m| !m.acks_for(agent).is_empty()).await;
        self.mqtt_client.acks_for(agent).into_iter().next()
    }

    /// Au moins `count` commandes sur `data/<agent>`, dans l'ordre de publication
    pub async fn wait_for_commands(&self, agent: &str, count: usize, timeout_ms: u64) -> Vec<WorkloadCommand> {
        if !self.poll_until(timeout_ms, |m| m.commands_for(agent).len() >= count).await {
            log::warn!("⏰ Timeout waiting for {} command(s) on {}", count, topics::data_topic(agent));
        }
        self.mqtt_client.commands_for(agent)
    }

    /// Nombre de messages par topic
    pub fn topic_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for msg in self.mqtt_client.get_published_messages() {
            *counts.entry(msg.topic).or_insert(0) += 1;
        }
        counts
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::MessageBuilder;
    use fleet_proto::publish_json;

    #[tokio::test]
    async fn test_wait_sees_late_publication() {
        let harness = TestHarness::new();
        let mock = harness.mqtt_client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            publish_json(&mock, "ctl/edge-1", &MessageBuilder::ack("X", "edge-1")).await.unwrap();
        });

        let ack = harness.wait_for_ack("edge-1", 1000).await.unwrap();
        assert_eq!(ack.identifier, "X");
        assert_eq!(harness.topic_counts()["ctl/edge-1"], 1);
    }

    #[tokio::test]
    async fn test_wait_times_out_empty() {
        let harness = TestHarness::new();
        assert!(harness.wait_for_message("ctl/none", 30).await.unwrap().is_none());
        assert!(harness.wait_for_commands("none", 1, 30).await.is_empty());
    }
}
