//! Registration handshake, agent side
//!
//! Publish a Registering heartbeat carrying a fresh correlation identifier,
//! then wait on the local correlation cache for the kernel's ack. The kernel
//! only acks on its periodic sweep, so the wait is one heartbeat interval.
//! Failures are never terminal: the caller backs off and retries with a new
//! identifier and the same sequence number.

use fleet_proto::{publish_json, topics, Ack, CorrelationCache, HeartbeatRecord, Publisher, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("no ack for {identifier} within {waited:?}")]
    Timeout { identifier: String, waited: Duration },
    #[error("kernel refused registration {0}")]
    Rejected(String),
    #[error("cannot publish heartbeat: {0}")]
    Transport(#[from] TransportError),
}

pub struct Registrar {
    publisher: Arc<dyn Publisher>,
    acks: Arc<CorrelationCache<Ack>>,
    ack_wait: Duration,
    backoff: Duration,
}

impl Registrar {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        acks: Arc<CorrelationCache<Ack>>,
        ack_wait: Duration,
        backoff: Duration,
    ) -> Self {
        Self { publisher, acks, ack_wait, backoff }
    }

    /// One attempt: publish, then wait for the matching ack.
    pub async fn register(&self, record: &HeartbeatRecord) -> Result<Ack, RegistrationError> {
        publish_json(self.publisher.as_ref(), topics::HEARTBEAT_TOPIC, record).await?;

        match self.acks.pop_wait(&record.identifier, self.ack_wait).await {
            Some(ack) if ack.registerd => Ok(ack),
            Some(ack) => Err(RegistrationError::Rejected(ack.identifier)),
            None => Err(RegistrationError::Timeout {
                identifier: record.identifier.clone(),
                waited: self.ack_wait,
            }),
        }
    }

    /// Retries until acked. `next_record` builds each attempt's heartbeat and
    /// must hand out a fresh identifier. `None` only on shutdown.
    pub async fn register_until_acked<F>(&self, mut next_record: F, shutdown: &mut watch::Receiver<bool>) -> Option<Ack>
    where
        F: FnMut() -> HeartbeatRecord,
    {
        let mut attempt = 0u32;
        loop {
            if *shutdown.borrow() {
                return None;
            }
            attempt += 1;
            let record = next_record();

            let outcome = tokio::select! {
                res = self.register(&record) => res,
                _ = shutdown.changed() => return None,
            };
            match outcome {
                Ok(ack) => {
                    info!("{} registered after {} attempt(s) [{}]", record.name, attempt, ack.identifier);
                    return Some(ack);
                }
                Err(e) => warn!("{} registration attempt {} failed: {}", record.name, attempt, e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.backoff) => {}
                _ = shutdown.changed() => return None,
            }
        }
    }
}
