/**
 * AGENTS REGISTRY - Machine d'état des agents de la flotte
 *
 * RÔLE : miroir en mémoire du dernier heartbeat accepté de chaque agent,
 * plus l'heure de dernière réception (jamais envoyée sur le fil).
 *
 * FONCTIONNEMENT :
 * - Registering : premier heartbeat d'un agent inconnu ou Offline, ou agent
 *   qui annonce lui-même Registering (redémarrage)
 * - Registered : posé par le sweep périodique, qui génère alors un unique ack
 * - Offline : posé par le même sweep quand now - last_seen >= timeout
 * - Un seul RwLock pour toute la map : écritures courtes à l'ingestion,
 *   section exclusive longue pendant le sweep
 *
 * UTILITÉ : découple l'ingestion (faible latence) de l'émission des acks (par lots).
 */

use fleet_proto::{Ack, HeartbeatRecord, NodeState};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, trace};

use crate::models::{AgentEntry, NodeQueryStatus};

pub type AgentsMap = HashMap<String, AgentEntry>;

/// Ce que l'arrivée d'un heartbeat a changé pour l'agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// agent jamais vu
    New,
    /// agent Offline (ou redémarré) qui repasse en Registering
    Rejoined,
    Known,
}

/// Compteurs d'un passage du sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub registering: usize,
    pub registered: usize,
    pub offline: usize,
    /// minutes depuis le dernier heartbeat (0..=30) -> nombre d'agents
    pub silence_minutes: BTreeMap<u32, usize>,
}

impl SweepStats {
    pub fn total(&self) -> usize {
        self.registering + self.registered + self.offline
    }
}

#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// acks à publier, un par agent promu
    pub acks: Vec<Ack>,
    pub went_offline: Vec<String>,
    pub statuses: HashMap<String, NodeQueryStatus>,
    pub stats: SweepStats,
    /// map complète sérialisée en JSON
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: RwLock<AgentsMap>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: AgentsMap) -> Self {
        Self { agents: RwLock::new(entries) }
    }

    /// Enregistre un heartbeat déjà accepté par le filtre.
    pub fn receive_heartbeat(&self, mut record: HeartbeatRecord, now: OffsetDateTime) -> Arrival {
        let mut agents = self.agents.write();
        let arrival = match agents.get(&record.name) {
            None => Arrival::New,
            Some(prev) if prev.record.state == NodeState::Offline => Arrival::Rejoined,
            Some(_) if record.state == NodeState::Registering => Arrival::Rejoined,
            Some(_) => Arrival::Known,
        };

        record.state = match arrival {
            Arrival::New | Arrival::Rejoined => NodeState::Registering,
            // une fois enregistré, l'état côté kernel fait foi
            Arrival::Known => agents
                .get(&record.name)
                .map(|prev| prev.record.state)
                .unwrap_or(NodeState::Registering),
        };
        trace!("heartbeat {} seq {} -> {} ({:?})", record.name, record.seqnum, record.state, arrival);

        let name = record.name.clone();
        agents.insert(name, AgentEntry { record, last_seen: now });
        arrival
    }

    /// Passage périodique : Offline sur timeout, Registering -> Registered (+ ack),
    /// projection de requête et sérialisation, le tout sous le verrou exclusif.
    pub fn sweep(&self, now: OffsetDateTime, timeout: Duration) -> Result<SweepOutcome, serde_json::Error> {
        let mut out = SweepOutcome::default();
        let mut agents = self.agents.write();

        for entry in agents.values_mut() {
            let silence = now - entry.last_seen;
            let hb = &mut entry.record;

            if hb.state == NodeState::Registered && silence >= timeout {
                debug!("{} offline, silent for {}s", hb.name, silence.whole_seconds());
                hb.state = NodeState::Offline;
                out.went_offline.push(hb.name.clone());
            }

            if hb.state == NodeState::Registering {
                hb.state = NodeState::Registered;
                out.acks.push(Ack {
                    identifier: hb.identifier.clone(),
                    registerd: true,
                    agent_name: hb.name.clone(),
                });
                debug!("ack due for {} [{}]", hb.name, hb.identifier);
            }

            out.statuses.insert(
                hb.name.clone(),
                NodeQueryStatus { name: hb.name.clone(), state: hb.state, last_observed: now },
            );

            let minutes = (silence.whole_seconds().max(0) / 60).min(30) as u32;
            *out.stats.silence_minutes.entry(minutes).or_default() += 1;

            match hb.state {
                NodeState::Registering => out.stats.registering += 1,
                NodeState::Registered => out.stats.registered += 1,
                NodeState::Offline => out.stats.offline += 1,
            }
        }

        out.payload = serde_json::to_vec(&*agents)?;
        Ok(out)
    }

    pub fn get(&self, name: &str) -> Option<AgentEntry> {
        self.agents.read().get(name).cloned()
    }

    pub fn state_of(&self, name: &str) -> Option<NodeState> {
        self.agents.read().get(name).map(|e| e.record.state)
    }

    pub fn entries(&self) -> AgentsMap {
        self.agents.read().clone()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const TIMEOUT: Duration = Duration::from_secs(300);

    fn hb(name: &str, id: &str, seq: u64) -> HeartbeatRecord {
        HeartbeatRecord {
            name: name.into(),
            identifier: id.into(),
            seqnum: seq,
            state: NodeState::Registering,
            ..Default::default()
        }
    }

    fn registered(reg: &AgentRegistry, name: &str, at: OffsetDateTime) {
        reg.receive_heartbeat(hb(name, "id0", 1), at);
        reg.sweep(at, TIMEOUT).unwrap();
        assert_eq!(reg.state_of(name), Some(NodeState::Registered));
    }

    #[test]
    fn test_new_agent_is_registering() {
        let reg = AgentRegistry::new();
        let t0 = datetime!(2024-05-01 12:00 UTC);
        assert_eq!(reg.receive_heartbeat(hb("a", "X", 1), t0), Arrival::New);
        assert_eq!(reg.state_of("a"), Some(NodeState::Registering));
        assert_eq!(reg.get("a").unwrap().last_seen, t0);
    }

    #[test]
    fn test_sweep_promotes_once_and_acks_identifier() {
        let reg = AgentRegistry::new();
        let t0 = datetime!(2024-05-01 12:00 UTC);
        reg.receive_heartbeat(hb("a", "X", 1), t0);

        let out = reg.sweep(t0, TIMEOUT).unwrap();
        assert_eq!(out.acks.len(), 1);
        assert_eq!(out.acks[0].identifier, "X");
        assert_eq!(out.acks[0].agent_name, "a");
        assert!(out.acks[0].registerd);
        assert_eq!(out.stats.registered, 1);

        let again = reg.sweep(t0, TIMEOUT).unwrap();
        assert!(again.acks.is_empty());
    }

    #[test]
    fn test_steady_heartbeat_keeps_registered() {
        let reg = AgentRegistry::new();
        let t0 = datetime!(2024-05-01 12:00 UTC);
        registered(&reg, "a", t0);

        let mut steady = hb("a", "Y", 2);
        steady.state = NodeState::Registered;
        assert_eq!(reg.receive_heartbeat(steady, t0 + time::Duration::minutes(2)), Arrival::Known);
        assert_eq!(reg.state_of("a"), Some(NodeState::Registered));
    }

    #[test]
    fn test_offline_detection_boundary() {
        let reg = AgentRegistry::new();
        let t0 = datetime!(2024-05-01 12:00 UTC);
        registered(&reg, "late", t0);
        registered(&reg, "fresh", t0 + time::Duration::seconds(2));

        let now = t0 + time::Duration::seconds(301);
        let out = reg.sweep(now, TIMEOUT).unwrap();
        assert_eq!(out.went_offline, vec!["late".to_string()]);
        assert_eq!(reg.state_of("late"), Some(NodeState::Offline));
        // fresh has been silent for 299s
        assert_eq!(reg.state_of("fresh"), Some(NodeState::Registered));
        assert_eq!(out.stats.offline, 1);
        assert_eq!(out.stats.registered, 1);
    }

    #[test]
    fn test_offline_agent_rejoins_through_registering() {
        let reg = AgentRegistry::new();
        let t0 = datetime!(2024-05-01 12:00 UTC);
        registered(&reg, "a", t0);
        let later = t0 + time::Duration::hours(1);
        reg.sweep(later, TIMEOUT).unwrap();
        assert_eq!(reg.state_of("a"), Some(NodeState::Offline));

        let mut back = hb("a", "Z", 2);
        back.state = NodeState::Registered;
        assert_eq!(reg.receive_heartbeat(back, later), Arrival::Rejoined);
        assert_eq!(reg.state_of("a"), Some(NodeState::Registering));

        let out = reg.sweep(later, TIMEOUT).unwrap();
        assert_eq!(out.acks[0].identifier, "Z");
    }

    #[test]
    fn test_restarted_agent_registers_again() {
        let reg = AgentRegistry::new();
        let t0 = datetime!(2024-05-01 12:00 UTC);
        registered(&reg, "a", t0);
        assert_eq!(reg.receive_heartbeat(hb("a", "R", 2), t0), Arrival::Rejoined);
        assert_eq!(reg.state_of("a"), Some(NodeState::Registering));
    }

    #[test]
    fn test_silence_histogram_buckets() {
        let reg = AgentRegistry::new();
        let t0 = datetime!(2024-05-01 12:00 UTC);
        reg.receive_heartbeat(hb("a", "1", 1), t0);
        reg.receive_heartbeat(hb("b", "2", 1), t0 - time::Duration::seconds(150));
        reg.receive_heartbeat(hb("c", "3", 1), t0 - time::Duration::hours(5));

        let out = reg.sweep(t0, TIMEOUT).unwrap();
        assert_eq!(out.stats.silence_minutes.get(&0), Some(&1));
        assert_eq!(out.stats.silence_minutes.get(&2), Some(&1));
        assert_eq!(out.stats.silence_minutes.get(&30), Some(&1));
        assert_eq!(out.stats.total(), 3);
    }

    #[test]
    fn test_payload_round_trips() {
        let reg = AgentRegistry::new();
        let t0 = datetime!(2024-05-01 12:00 UTC);
        reg.receive_heartbeat(hb("a", "X", 4), t0);
        let out = reg.sweep(t0, TIMEOUT).unwrap();

        let back: AgentsMap = serde_json::from_slice(&out.payload).unwrap();
        assert_eq!(back, reg.entries());
        assert_eq!(out.statuses["a"].state, NodeState::Registered);
    }

    #[test]
    fn test_statuses_carry_sweep_time() {
        let reg = AgentRegistry::new();
        let t0 = datetime!(2024-05-01 12:00 UTC);
        reg.receive_heartbeat(hb("a", "X", 4), t0);
        let later = t0 + time::Duration::seconds(42);
        let out = reg.sweep(later, TIMEOUT).unwrap();
        assert_eq!(out.statuses["a"].last_observed, later);

        let json = serde_json::to_value(&out.statuses["a"]).unwrap();
        assert_eq!(json["lastObserved"], "2024-05-01T12:00:42Z");
    }
}
