/*!
Builders de messages de test

Construit des heartbeats, acks et commandes workload conformes au format
échangé sur `heartbeat`, `ctl/<agent>` et `data/<agent>`.
*/

use fleet_proto::{
    Ack, Address, AddressType, HeartbeatRecord, NodeInfo, NodeState, NodeStatus, Resources,
    WorkloadCommand, WorkloadPhase, WorkloadSpec, WorkloadStatus, WorkloadSummary,
};
use std::collections::BTreeMap;

/// Builder fluide pour `HeartbeatRecord`
#[derive(Debug, Clone)]
pub struct HeartbeatBuilder {
    record: HeartbeatRecord,
}

impl HeartbeatBuilder {
    /// Heartbeat Registering avec un identifiant neuf et un statut réaliste
    pub fn new(name: &str) -> Self {
        let labels = BTreeMap::from([("HostName".to_string(), name.to_string())]);
        Self {
            record: HeartbeatRecord {
                name: name.to_string(),
                labels,
                timestamp: fleet_proto::unix_millis(),
                identifier: uuid::Uuid::new_v4().to_string(),
                seqnum: 1,
                state: NodeState::Registering,
                status: Some(MessageBuilder::node_status()),
                pods: Vec::new(),
            },
        }
    }

    pub fn seq(mut self, seqnum: u64) -> Self {
        self.record.seqnum = seqnum;
        self
    }

    pub fn timestamp(mut self, millis: i64) -> Self {
        self.record.timestamp = millis;
        self
    }

    pub fn identifier(mut self, id: &str) -> Self {
        self.record.identifier = id.to_string();
        self
    }

    pub fn state(mut self, state: NodeState) -> Self {
        self.record.state = state;
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.record.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Ajoute un workload observé en phase Running
    pub fn running(mut self, namespace: &str, name: &str, hash: &str) -> Self {
        self.record.pods.push(WorkloadSummary {
            hash: hash.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            status: Some(WorkloadStatus { phase: WorkloadPhase::Running }),
        });
        self
    }

    pub fn build(self) -> HeartbeatRecord {
        self.record
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(&self.record).unwrap_or_default()
    }
}

/// Helpers pour les autres messages du protocole
pub struct MessageBuilder;

impl MessageBuilder {
    pub fn node_status() -> NodeStatus {
        NodeStatus {
            addresses: vec![
                Address { address: "127.0.0.1".into(), address_type: AddressType::InternalIp },
                Address { address: "localhost".into(), address_type: AddressType::HostName },
            ],
            allocatable: Some(Resources { cpu: 6000, memory: 6000 * 1024, pods: 8 }),
            capacity: Some(Resources { cpu: 8000, memory: 8000 * 1024, pods: 10 }),
            node_info: Some(NodeInfo {
                architecture: "amd64".into(),
                agent_version: "v0.1.0".into(),
                kernel_version: "6.1.0".into(),
            }),
        }
    }

    pub fn ack(identifier: &str, agent: &str) -> Ack {
        Ack {
            identifier: identifier.to_string(),
            registerd: true,
            agent_name: agent.to_string(),
        }
    }

    pub fn spec(image: &str) -> WorkloadSpec {
        WorkloadSpec {
            image: image.to_string(),
            ..Default::default()
        }
    }

    pub fn sync_command(namespace: &str, name: &str, image: &str) -> WorkloadCommand {
        let spec = Self::spec(image);
        let hash = fleet_proto::spec_hash(&spec).unwrap_or_default();
        WorkloadCommand::sync(hash, name, namespace, spec)
    }

    pub fn delete_command(namespace: &str, name: &str, hash: &str) -> WorkloadCommand {
        WorkloadCommand::delete(hash, name, namespace, time::OffsetDateTime::now_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_builder() {
        let hb = HeartbeatBuilder::new("edge-1")
            .seq(4)
            .identifier("X")
            .label("zone", "a")
            .running("fleet", "fleetset-web", "h1")
            .build();
        assert_eq!(hb.seqnum, 4);
        assert_eq!(hb.identifier, "X");
        assert_eq!(hb.labels["zone"], "a");
        assert_eq!(hb.pods[0].key(), "fleet-fleetset-web");

        let back = HeartbeatRecord::from_slice(&serde_json::to_vec(&hb).unwrap()).unwrap();
        assert_eq!(back, hb);
    }

    #[test]
    fn test_fresh_identifiers() {
        let a = HeartbeatBuilder::new("n").build();
        let b = HeartbeatBuilder::new("n").build();
        assert_ne!(a.identifier, b.identifier);
    }

    #[test]
    fn test_timestamp_is_wall_clock_millis() {
        let before = fleet_proto::unix_millis();
        let hb = HeartbeatBuilder::new("n").build();
        let after = fleet_proto::unix_millis();
        assert!(hb.timestamp >= before && hb.timestamp <= after);
        assert!(hb.timestamp > 1_600_000_000_000);
    }

    #[test]
    fn test_command_builders() {
        let sync = MessageBuilder::sync_command("fleet", "w", "nginx");
        assert!(!sync.is_delete());
        assert_eq!(sync.hash.len(), 64);
        assert!(MessageBuilder::delete_command("fleet", "w", "h").is_delete());
    }
}
