//! One simulated edge agent
//!
//! Lifecycle of an instance:
//! - register: Registering heartbeats until the kernel acks one
//! - steady state: Registered heartbeats every interval, same seqnum,
//!   increasing timestamp, fresh identifier
//! - inbound: acks feed the correlation cache, workload commands feed
//!   the local workload store
//!
//! Each instance owns its MQTT connection; `spawn_instance` wires it up.

use crate::config::{AgentSettings, MqttConfig};
use crate::registration::Registrar;
use crate::workloads::LocalWorkloads;
use fleet_proto::topics::{self, AgentChannel};
use fleet_proto::{
    publish_json, Ack, CorrelationCache, HeartbeatRecord, NodeState, NodeStatus, Publisher, WorkloadCommand,
};
use parking_lot::RwLock;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const RECONNECT_PAUSE: Duration = Duration::from_secs(5);
const ACK_RETENTION: Duration = Duration::from_secs(300);

/// Host status shared by every instance of the process
pub type SharedStatus = Arc<RwLock<NodeStatus>>;

pub struct AgentInstance {
    name: String,
    labels: BTreeMap<String, String>,
    seqnum: u64,
    publisher: Arc<dyn Publisher>,
    acks: Arc<CorrelationCache<Ack>>,
    workloads: Arc<LocalWorkloads>,
    status: SharedStatus,
    settings: AgentSettings,
}

impl AgentInstance {
    pub fn new(
        name: impl Into<String>,
        seqnum: u64,
        publisher: Arc<dyn Publisher>,
        status: SharedStatus,
        settings: AgentSettings,
    ) -> Self {
        let name = name.into();
        let labels = BTreeMap::from([
            ("HostName".to_string(), name.clone()),
            ("arch".to_string(), std::env::consts::ARCH.to_string()),
        ]);
        Self {
            name,
            labels,
            seqnum,
            publisher,
            acks: Arc::new(CorrelationCache::new()),
            workloads: Arc::new(LocalWorkloads::new()),
            status,
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn seqnum(&self) -> u64 {
        self.seqnum
    }

    pub fn acks(&self) -> &Arc<CorrelationCache<Ack>> {
        &self.acks
    }

    pub fn workloads(&self) -> &Arc<LocalWorkloads> {
        &self.workloads
    }

    /// Heartbeat with a fresh identifier and the current time.
    pub fn heartbeat(&self, state: NodeState) -> HeartbeatRecord {
        HeartbeatRecord {
            name: self.name.clone(),
            labels: self.labels.clone(),
            timestamp: fleet_proto::unix_millis(),
            identifier: uuid::Uuid::new_v4().to_string(),
            seqnum: self.seqnum,
            state,
            status: Some(self.status.read().clone()),
            pods: self.workloads.summaries(),
        }
    }

    /// Routes a message received on this instance's connection.
    pub fn handle_inbound(&self, topic: &str, payload: &[u8]) {
        match topics::parse_agent_topic(topic) {
            Some(AgentChannel::Ctl(name)) if name == self.name => match Ack::from_slice(payload) {
                Ok(ack) => {
                    debug!("{}: ack {} received", self.name, ack.identifier);
                    self.acks.set(ack.identifier.clone(), ack);
                }
                Err(e) => warn!("{}: malformed ack: {}", self.name, e),
            },
            Some(AgentChannel::Data(name)) if name == self.name => match WorkloadCommand::from_slice(payload) {
                Ok(cmd) => {
                    self.workloads.apply(&cmd);
                }
                Err(e) => warn!("{}: malformed workload command: {}", self.name, e),
            },
            _ => debug!("{}: ignoring message on {}", self.name, topic),
        }
    }

    /// Registers, then heartbeats until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.settings.heartbeat_interval();
        let registrar = Registrar::new(
            self.publisher.clone(),
            self.acks.clone(),
            interval,
            self.settings.registration_backoff(),
        );

        let acked = registrar
            .register_until_acked(|| self.heartbeat(NodeState::Registering), &mut shutdown)
            .await;
        if acked.is_none() {
            info!("{}: stopped before registration", self.name);
            return;
        }

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let hb = self.heartbeat(NodeState::Registered);
                    if let Err(e) = publish_json(self.publisher.as_ref(), topics::HEARTBEAT_TOPIC, &hb).await {
                        error!("{}: heartbeat failed: {}", self.name, e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("{}: stopping", self.name);
                    return;
                }
            }
        }
    }
}

pub fn mqtt_options(cfg: &MqttConfig, client_id: &str) -> MqttOptions {
    let mut opts = MqttOptions::new(client_id, &cfg.broker_host, cfg.broker_port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
    opts.set_clean_session(true);
    opts
}

async fn subscribe_channels(client: &AsyncClient, name: &str) {
    for topic in [topics::ctl_topic(name), topics::data_topic(name)] {
        if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
            error!("{}: subscribe to {} failed: {}", name, topic, e);
        }
    }
}

fn spawn_drain(
    instance: Arc<AgentInstance>,
    client: AsyncClient,
    mut eventloop: EventLoop,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if let Err(e) = client.disconnect().await {
                        debug!("{}: disconnect: {}", instance.name, e);
                    }
                    break;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::Publish(p))) => instance.handle_inbound(&p.topic, &p.payload),
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("{}: connected, subscribing", instance.name);
                        let client = client.clone();
                        let name = instance.name.clone();
                        tokio::spawn(async move { subscribe_channels(&client, &name).await });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("{}: MQTT connection error: {}", instance.name, e);
                        tokio::time::sleep(RECONNECT_PAUSE).await;
                    }
                }
            }
        }
    })
}

/// Connects one instance and runs it; the returned handle finishes on shutdown.
pub fn spawn_instance(
    name: String,
    seqnum: u64,
    mqtt: &MqttConfig,
    settings: AgentSettings,
    status: SharedStatus,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let client_id = format!("{}-{}", name, uuid::Uuid::new_v4().simple());
    let (client, eventloop) = AsyncClient::new(mqtt_options(mqtt, &client_id), 32);

    let instance = Arc::new(AgentInstance::new(name, seqnum, Arc::new(client.clone()), status, settings));
    let sweeper = instance.acks.spawn_sweeper(ACK_RETENTION, ACK_RETENTION);
    let drain = spawn_drain(instance.clone(), client, eventloop, shutdown.clone());

    tokio::spawn(async move {
        info!("{}: starting with seqnum {}", instance.name, instance.seqnum);
        instance.run(shutdown).await;
        sweeper.abort();
        if let Err(e) = drain.await {
            warn!("{}: drain task ended abnormally: {}", instance.name, e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_devkit::{MessageBuilder, MockMqttClient};

    fn instance(mock: &Arc<MockMqttClient>) -> Arc<AgentInstance> {
        let settings = AgentSettings {
            heartbeat_interval_secs: 1,
            registration_backoff_secs: 1,
            ..AgentSettings::default()
        };
        let status = Arc::new(RwLock::new(MessageBuilder::node_status()));
        Arc::new(AgentInstance::new("edge-0", 4, mock.clone(), status, settings))
    }

    #[test]
    fn test_heartbeat_fields() {
        let mock = Arc::new(MockMqttClient::new());
        let agent = instance(&mock);
        let a = agent.heartbeat(NodeState::Registering);
        let b = agent.heartbeat(NodeState::Registered);
        assert_eq!(a.seqnum, 4);
        assert_eq!(b.seqnum, 4);
        assert_ne!(a.identifier, b.identifier);
        assert!(b.timestamp >= a.timestamp);
        assert_eq!(a.labels.get("HostName").map(String::as_str), Some("edge-0"));
        assert!(a.status.is_some());
    }

    #[test]
    fn test_inbound_routing() {
        let mock = Arc::new(MockMqttClient::new());
        let agent = instance(&mock);

        let ack = serde_json::to_vec(&MessageBuilder::ack("id-1", "edge-0")).unwrap();
        agent.handle_inbound("ctl/edge-0", &ack);
        assert!(agent.acks().get("id-1").is_some());

        let cmd = serde_json::to_vec(&MessageBuilder::sync_command("fleet", "fleetset-web", "nginx")).unwrap();
        agent.handle_inbound("data/edge-0", &cmd);
        agent.handle_inbound("data/edge-0", &cmd);
        assert_eq!(agent.workloads().len(), 1);
        assert_eq!(agent.heartbeat(NodeState::Registered).pods.len(), 1);

        // other agents' channels and garbage are ignored
        agent.handle_inbound("data/edge-9", &cmd);
        agent.handle_inbound("ctl/edge-0", b"not json");
        assert_eq!(agent.acks().len(), 1);
    }

    #[tokio::test]
    async fn test_run_registers_then_heartbeats_registered() {
        let mock = Arc::new(MockMqttClient::new());
        let agent = instance(&mock);

        let acks = agent.acks().clone();
        mock.on_publish(move |msg| {
            if let Ok(hb) = HeartbeatRecord::from_slice(&msg.payload) {
                if hb.state == NodeState::Registering {
                    acks.set(hb.identifier.clone(), Ack { identifier: hb.identifier, registerd: true, agent_name: hb.name });
                }
            }
        });

        let (tx, rx) = watch::channel(false);
        let runner = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run(rx).await })
        };
        tokio::time::sleep(Duration::from_millis(1_300)).await;
        tx.send(true).unwrap();
        runner.await.unwrap();

        let sent: Vec<HeartbeatRecord> = mock
            .find_messages_by_topic(topics::HEARTBEAT_TOPIC)
            .iter()
            .map(|m| HeartbeatRecord::from_slice(&m.payload).unwrap())
            .collect();
        assert!(sent.len() >= 2);
        assert_eq!(sent[0].state, NodeState::Registering);
        assert!(sent[1..].iter().all(|hb| hb.state == NodeState::Registered));
        assert!(sent.iter().all(|hb| hb.seqnum == 4));
    }

    #[test]
    fn test_mqtt_options_from_config() {
        let cfg = MqttConfig { broker_host: "broker".into(), broker_port: 1884, keep_alive_secs: 15 };
        let opts = mqtt_options(&cfg, "edge-0-abc");
        assert_eq!(opts.broker_address(), ("broker".to_string(), 1884));
        assert_eq!(opts.keep_alive(), Duration::from_secs(15));
        assert_eq!(opts.client_id(), "edge-0-abc");
    }
}
