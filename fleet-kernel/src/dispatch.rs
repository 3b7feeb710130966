/**
 * DISPATCHER - Publication asynchrone best-effort
 *
 * RÔLE : file bornée vidée par un pool de workers ; l'ingestion et le sweep
 * n'attendent jamais le réseau.
 *
 * FONCTIONNEMENT :
 * - try_dispatch : sérialise puis enfile ; file pleine = message abandonné et compté
 * - chaque worker publie un message à la fois, une erreur de publish est loguée, jamais rejouée
 * - les workers s'arrêtent quand le dernier Dispatcher est libéré
 */

use fleet_proto::{topics, Ack, Publisher, WorkloadCommand};
use rumqttc::QoS;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

struct Envelope {
    topic: String,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct DispatchCounters {
    pub queued: AtomicU64,
    pub published: AtomicU64,
    pub failed: AtomicU64,
    pub dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub queued: u64,
    pub published: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Envelope>,
    counters: Arc<DispatchCounters>,
}

impl Dispatcher {
    /// Démarre `workers` tâches de publication sur une file de `capacity` messages.
    pub fn spawn(publisher: Arc<dyn Publisher>, workers: usize, capacity: usize) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel::<Envelope>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(DispatchCounters::default());

        let handles = (0..workers.max(1))
            .map(|id| {
                let rx = rx.clone();
                let publisher = publisher.clone();
                let counters = counters.clone();
                tokio::spawn(async move {
                    loop {
                        // verrou relâché dès le message obtenu, les autres workers enchaînent
                        let next = rx.lock().await.recv().await;
                        let Some(env) = next else { break };
                        match publisher.publish_bytes(&env.topic, QoS::AtLeastOnce, env.payload).await {
                            Ok(()) => {
                                counters.published.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                counters.failed.fetch_add(1, Ordering::Relaxed);
                                error!("publish to {} failed: {}", env.topic, e);
                            }
                        }
                    }
                    debug!("publish worker {} stopped", id);
                })
            })
            .collect();

        (Self { tx, counters }, handles)
    }

    /// Enfile sans attendre. `false` si le message a été abandonné.
    pub fn try_dispatch<T: Serialize + ?Sized>(&self, topic: String, value: &T) -> bool {
        let payload = match serde_json::to_vec(value) {
            Ok(p) => p,
            Err(e) => {
                error!("cannot serialize message for {}: {}", topic, e);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        match self.tx.try_send(Envelope { topic, payload }) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(env)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("publish queue full, dropping message for {}", env.topic);
                false
            }
            Err(mpsc::error::TrySendError::Closed(env)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("publish queue closed, dropping message for {}", env.topic);
                false
            }
        }
    }

    pub fn dispatch_ack(&self, ack: &Ack) -> bool {
        self.try_dispatch(topics::ctl_topic(&ack.agent_name), ack)
    }

    pub fn dispatch_command(&self, agent: &str, cmd: &WorkloadCommand) -> bool {
        self.try_dispatch(topics::data_topic(agent), cmd)
    }

    pub fn dispatch_commands<'a, I>(&self, agent: &str, cmds: I) -> usize
    where
        I: IntoIterator<Item = &'a WorkloadCommand>,
    {
        cmds.into_iter().filter(|c| self.dispatch_command(agent, c)).count()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}
