//! Publishing seam
//!
//! Everything that sends on the bus goes through `Publisher`, so the kernel
//! and the agents can be driven by an in-memory broker in tests.

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("broker unreachable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_bytes(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), TransportError>;
}

#[async_trait]
impl Publisher for AsyncClient {
    async fn publish_bytes(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), TransportError> {
        self.publish(topic, qos, false, payload).await?;
        Ok(())
    }
}

/// Serializes `value` to JSON and publishes it at-least-once.
pub async fn publish_json<P, T>(publisher: &P, topic: &str, value: &T) -> Result<(), TransportError>
where
    P: Publisher + ?Sized,
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(value)?;
    publisher.publish_bytes(topic, QoS::AtLeastOnce, payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, QoS, Vec<u8>)>>,
    }

    #[async_trait]
    impl Publisher for Recorder {
        async fn publish_bytes(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), TransportError> {
            if topic.is_empty() {
                return Err(TransportError::Unavailable("no topic".into()));
            }
            self.sent.lock().push((topic.to_string(), qos, payload));
            Ok(())
        }
    }

    #[tokio::test]
    async fn publish_json_sends_at_least_once() {
        let rec = Recorder::default();
        publish_json(&rec, "ctl/edge-1", &serde_json::json!({"registerd": true})).await.unwrap();

        let sent = rec.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "ctl/edge-1");
        assert_eq!(sent[0].1, QoS::AtLeastOnce);
        assert_eq!(sent[0].2, br#"{"registerd":true}"#.to_vec());
    }

    #[tokio::test]
    async fn publish_json_errors_map_to_variants() {
        let rec = Recorder::default();
        // serde_json rejects non-string map keys
        let bad: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);
        let err = publish_json(&rec, "ctl/edge-1", &bad).await.unwrap_err();
        assert!(matches!(err, TransportError::Serialization(_)));
        assert!(rec.sent.lock().is_empty());

        let err = publish_json(&rec, "", &1).await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)));
        assert_eq!(err.to_string(), "broker unreachable: no topic");
    }
}
