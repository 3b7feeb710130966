/**
 * RECONCILER - Écart entre workloads désirés et observés, par agent
 *
 * RÔLE : maintient, pour chaque agent, la map clé -> workload désiré dérivée
 * des définitions fleet-wide (filtrées par node_selector sur les labels).
 *
 * FONCTIONNEMENT :
 * - reconcile(heartbeat) : désiré absent ou hash différent -> sync ;
 *   observé non désiré -> delete horodaté
 * - apply_definition / delete_definition : recalcul pour chaque agent connu
 * - add_host : amorce le désiré d'un nouvel agent (ou suit un changement de labels)
 *
 * Les commandes sont retournées, jamais publiées ici : l'appelant les pousse
 * au dispatcher hors verrou.
 */

use fleet_proto::{spec_hash, HeartbeatRecord, WorkloadCommand, WorkloadSpec};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::models::WorkloadDefinition;

/// Commande adressée à un agent précis
pub type Outbound = (String, WorkloadCommand);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DesiredEntry {
    pub hash: String,
    pub name: String,
    pub namespace: String,
    pub spec: WorkloadSpec,
}

impl DesiredEntry {
    fn sync_command(&self) -> WorkloadCommand {
        WorkloadCommand::sync(&self.hash, &self.name, &self.namespace, self.spec.clone())
    }

    fn delete_command(&self, at: OffsetDateTime) -> WorkloadCommand {
        WorkloadCommand::delete(&self.hash, &self.name, &self.namespace, at)
    }
}

/// Définition vue depuis le désiré : combien d'agents doivent la faire tourner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionTarget {
    pub key: String,
    pub definition: WorkloadDefinition,
    pub hash: String,
    pub desired: usize,
}

#[derive(Debug, Clone)]
struct HashedDefinition {
    def: WorkloadDefinition,
    hash: String,
}

impl HashedDefinition {
    fn entry(&self) -> DesiredEntry {
        DesiredEntry {
            hash: self.hash.clone(),
            name: self.def.workload_name(),
            namespace: self.def.namespace.clone(),
            spec: self.def.spec.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct DesiredAgent {
    labels: BTreeMap<String, String>,
    workloads: HashMap<String, DesiredEntry>,
}

#[derive(Debug, Default)]
pub struct Reconciler {
    /// clé "<namespace>-fleetset-<name>" -> définition
    definitions: RwLock<BTreeMap<String, HashedDefinition>>,
    desired: RwLock<HashMap<String, DesiredAgent>>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_definitions(defs: Vec<WorkloadDefinition>) -> Result<Self, serde_json::Error> {
        let reconciler = Self::new();
        for def in defs {
            reconciler.apply_definition(def)?;
        }
        Ok(reconciler)
    }

    pub fn knows(&self, agent: &str) -> bool {
        self.desired.read().contains_key(agent)
    }

    /// Amorce le désiré d'un agent inconnu avec toutes les définitions qui le
    /// sélectionnent. Agent connu : seuls des labels modifiés déclenchent un recalcul.
    pub fn add_host(&self, agent: &str, labels: &BTreeMap<String, String>) -> Vec<WorkloadCommand> {
        // cas courant (agent connu, labels inchangés) : lecture seule
        if self
            .desired
            .read()
            .get(agent)
            .is_some_and(|existing| existing.labels == *labels)
        {
            return Vec::new();
        }

        let definitions = self.definitions.read();
        let mut desired = self.desired.write();

        if let Some(existing) = desired.get_mut(agent) {
            if existing.labels == *labels {
                return Vec::new();
            }
            existing.labels = labels.clone();
            let mut cmds = Vec::new();
            for (key, hd) in definitions.iter() {
                let selected = hd.def.spec.selects(labels);
                let present = existing.workloads.contains_key(key);
                if selected && !present {
                    let entry = hd.entry();
                    cmds.push(entry.sync_command());
                    existing.workloads.insert(key.clone(), entry);
                } else if !selected && present {
                    // l'observé le porte encore : le prochain heartbeat émettra le delete
                    existing.workloads.remove(key);
                }
            }
            debug!("{} relabelled, {} workloads to sync", agent, cmds.len());
            return cmds;
        }

        let workloads: HashMap<String, DesiredEntry> = definitions
            .iter()
            .filter(|(_, hd)| hd.def.spec.selects(labels))
            .map(|(key, hd)| (key.clone(), hd.entry()))
            .collect();
        let cmds = workloads.values().map(DesiredEntry::sync_command).collect::<Vec<_>>();
        desired.insert(agent.to_string(), DesiredAgent { labels: labels.clone(), workloads });
        info!("host {} added with {} desired workloads", agent, cmds.len());
        cmds
    }

    /// Diff désiré / observé pour un heartbeat accepté.
    pub fn reconcile(&self, record: &HeartbeatRecord) -> Vec<WorkloadCommand> {
        self.reconcile_at(record, OffsetDateTime::now_utc())
    }

    pub fn reconcile_at(&self, record: &HeartbeatRecord, now: OffsetDateTime) -> Vec<WorkloadCommand> {
        let desired = self.desired.read();
        let Some(agent) = desired.get(&record.name) else {
            return Vec::new();
        };

        let observed: HashMap<String, &str> = record
            .pods
            .iter()
            .map(|p| (p.key(), p.hash.as_str()))
            .collect();

        let mut cmds = Vec::new();
        for (key, entry) in &agent.workloads {
            match observed.get(key) {
                Some(hash) if *hash == entry.hash => {}
                _ => cmds.push(entry.sync_command()),
            }
        }
        for pod in &record.pods {
            if !agent.workloads.contains_key(&pod.key()) {
                cmds.push(WorkloadCommand::delete(&pod.hash, &pod.name, &pod.namespace, now));
            }
        }
        cmds
    }

    /// Ajout ou mise à jour d'une définition. Hash inchangé : rien à publier.
    pub fn apply_definition(&self, def: WorkloadDefinition) -> Result<Vec<Outbound>, serde_json::Error> {
        let hash = spec_hash(&def.spec)?;
        let key = def.key();
        let hd = HashedDefinition { def, hash };

        // ordre des verrous : definitions puis desired, comme add_host
        let mut definitions = self.definitions.write();
        if definitions.get(&key).is_some_and(|old| old.hash == hd.hash) {
            debug!("definition {} unchanged", key);
            return Ok(Vec::new());
        }
        definitions.insert(key.clone(), hd.clone());

        let now = OffsetDateTime::now_utc();
        let mut out = Vec::new();
        let mut desired = self.desired.write();
        for (agent, state) in desired.iter_mut() {
            if hd.def.spec.selects(&state.labels) {
                let entry = hd.entry();
                out.push((agent.clone(), entry.sync_command()));
                state.workloads.insert(key.clone(), entry);
            } else if let Some(old) = state.workloads.remove(&key) {
                out.push((agent.clone(), old.delete_command(now)));
            }
        }
        info!("definition {} applied, {} commands", key, out.len());
        Ok(out)
    }

    /// Supprime une définition : delete horodaté vers chaque agent qui la porte.
    pub fn delete_definition(&self, namespace: &str, name: &str) -> Option<Vec<Outbound>> {
        self.delete_definition_at(namespace, name, OffsetDateTime::now_utc())
    }

    pub fn delete_definition_at(&self, namespace: &str, name: &str, now: OffsetDateTime) -> Option<Vec<Outbound>> {
        let mut definitions = self.definitions.write();
        let key = definitions
            .values()
            .find(|hd| hd.def.namespace == namespace && hd.def.name == name)
            .map(|hd| hd.def.key())?;
        definitions.remove(&key);

        let mut out = Vec::new();
        let mut desired = self.desired.write();
        for (agent, state) in desired.iter_mut() {
            if let Some(old) = state.workloads.remove(&key) {
                debug!("delete {} from {}", key, agent);
                out.push((agent.clone(), old.delete_command(now)));
            }
        }
        info!("definition {} deleted, {} commands", key, out.len());
        Some(out)
    }

    /// Désiré complet d'un agent sous forme de commandes sync
    pub fn desired_commands(&self, agent: &str) -> Vec<WorkloadCommand> {
        self.desired
            .read()
            .get(agent)
            .map(|a| a.workloads.values().map(DesiredEntry::sync_command).collect())
            .unwrap_or_default()
    }

    pub fn desired_for(&self, agent: &str) -> Option<HashMap<String, DesiredEntry>> {
        self.desired.read().get(agent).map(|a| a.workloads.clone())
    }

    pub fn definitions(&self) -> Vec<WorkloadDefinition> {
        self.definitions.read().values().map(|hd| hd.def.clone()).collect()
    }

    /// Chaque définition avec son hash et le nombre d'agents qui la désirent
    pub fn targets(&self) -> Vec<DefinitionTarget> {
        let definitions = self.definitions.read();
        let desired = self.desired.read();
        definitions
            .iter()
            .map(|(key, hd)| DefinitionTarget {
                key: key.clone(),
                definition: hd.def.clone(),
                hash: hd.hash.clone(),
                desired: desired.values().filter(|a| a.workloads.contains_key(key)).count(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_proto::WorkloadSummary;
    use time::macros::datetime;

    fn def(name: &str, image: &str) -> WorkloadDefinition {
        WorkloadDefinition {
            name: name.into(),
            namespace: "fleet".into(),
            spec: WorkloadSpec { image: image.into(), ..Default::default() },
        }
    }

    fn zoned(name: &str, zone: &str) -> WorkloadDefinition {
        let mut d = def(name, "img");
        d.spec.node_selector.insert("zone".into(), zone.into());
        d
    }

    fn labels(zone: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("zone".to_string(), zone.to_string())])
    }

    fn hb_running(agent: &str, cmds: &[WorkloadCommand]) -> HeartbeatRecord {
        HeartbeatRecord {
            name: agent.into(),
            pods: cmds
                .iter()
                .map(|c| WorkloadSummary {
                    hash: c.hash.clone(),
                    name: c.name.clone(),
                    namespace: c.namespace.clone(),
                    status: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_add_host_seeds_matching_definitions() {
        let r = Reconciler::with_definitions(vec![def("web", "nginx"), zoned("edge", "b")]).unwrap();
        let cmds = r.add_host("a", &labels("a"));
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].name, "fleetset-web");
        assert!(cmds[0].spec.is_some());

        // second call for the same host is a no-op
        assert!(r.add_host("a", &labels("a")).is_empty());
    }

    #[test]
    fn test_unknown_host_reconciles_to_nothing() {
        let r = Reconciler::with_definitions(vec![def("web", "nginx")]).unwrap();
        assert!(r.reconcile(&hb_running("ghost", &[])).is_empty());
    }

    #[test]
    fn test_missing_and_outdated_workloads_are_synced() {
        let r = Reconciler::with_definitions(vec![def("web", "nginx"), def("db", "pg")]).unwrap();
        let seeded = r.add_host("a", &labels("a"));

        let mut running = hb_running("a", &seeded[..1]);
        running.pods[0].hash = "stale".into();
        let cmds = r.reconcile(&running);
        assert_eq!(cmds.len(), 2);
        assert!(cmds.iter().all(|c| c.spec.is_some()));
    }

    #[test]
    fn test_converged_agent_gets_nothing() {
        let r = Reconciler::with_definitions(vec![def("web", "nginx")]).unwrap();
        let seeded = r.add_host("a", &labels("a"));
        assert!(r.reconcile(&hb_running("a", &seeded)).is_empty());
    }

    #[test]
    fn test_undesired_workload_is_deleted_with_timestamp() {
        let r = Reconciler::new();
        r.add_host("a", &labels("a"));
        let now = datetime!(2024-05-01 12:00 UTC);
        let rogue = WorkloadCommand::sync("h", "rogue", "ns", WorkloadSpec::default());

        let cmds = r.reconcile_at(&hb_running("a", &[rogue]), now);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].delete_timestamp, Some(now));
        assert_eq!(cmds[0].hash, "h");
    }

    #[test]
    fn test_definition_update_republishes_only_on_hash_change() {
        let r = Reconciler::with_definitions(vec![def("web", "nginx:1")]).unwrap();
        r.add_host("a", &labels("a"));
        r.add_host("b", &labels("b"));

        assert!(r.apply_definition(def("web", "nginx:1")).unwrap().is_empty());

        let out = r.apply_definition(def("web", "nginx:2")).unwrap();
        assert_eq!(out.len(), 2);
        let new_hash = spec_hash(&def("web", "nginx:2").spec).unwrap();
        assert!(out.iter().all(|(_, c)| c.hash == new_hash));
        assert_eq!(r.desired_for("a").unwrap()["fleet-fleetset-web"].hash, new_hash);
    }

    #[test]
    fn test_selector_change_moves_workload() {
        let r = Reconciler::with_definitions(vec![zoned("edge", "a")]).unwrap();
        r.add_host("a1", &labels("a"));
        r.add_host("b1", &labels("b"));

        let out = r.apply_definition(zoned("edge", "b")).unwrap();
        let to_a: Vec<_> = out.iter().filter(|(n, _)| n == "a1").collect();
        let to_b: Vec<_> = out.iter().filter(|(n, _)| n == "b1").collect();
        assert!(to_a[0].1.is_delete());
        assert!(!to_b[0].1.is_delete());
    }

    #[test]
    fn test_delete_definition_tombstones_every_holder() {
        let r = Reconciler::with_definitions(vec![def("web", "nginx")]).unwrap();
        r.add_host("a", &labels("a"));
        r.add_host("b", &labels("b"));

        let at = datetime!(2024-05-01 12:00 UTC);
        let out = r.delete_definition_at("fleet", "web", at).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|(_, c)| c.delete_timestamp == Some(at)));
        assert!(r.desired_commands("a").is_empty());
        assert!(r.definitions().is_empty());
        assert!(r.delete_definition("fleet", "web").is_none());
    }

    #[test]
    fn test_unchanged_heartbeat_only_reads_desired() {
        let r = std::sync::Arc::new(Reconciler::with_definitions(vec![def("web", "nginx")]).unwrap());
        r.add_host("a", &labels("a"));
        let before = r.desired_for("a").unwrap();

        // a reader holds the map: a write from add_host would block here
        let guard = r.desired.read();
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = {
            let r = r.clone();
            std::thread::spawn(move || tx.send(r.add_host("a", &labels("a"))).unwrap())
        };
        let cmds = rx.recv_timeout(std::time::Duration::from_secs(2)).expect("add_host blocked on the write lock");
        drop(guard);
        worker.join().unwrap();

        assert!(cmds.is_empty());
        assert_eq!(r.desired_for("a").unwrap(), before);
    }

    #[test]
    fn test_concurrent_apply_and_delete_stay_consistent() {
        let r = std::sync::Arc::new(Reconciler::new());
        r.add_host("a", &labels("a"));

        for round in 0..50 {
            r.apply_definition(def("web", "nginx:0")).unwrap();
            let applier = {
                let r = r.clone();
                std::thread::spawn(move || r.apply_definition(def("web", &format!("nginx:{}", round + 1))).unwrap())
            };
            let deleter = {
                let r = r.clone();
                std::thread::spawn(move || r.delete_definition("fleet", "web"))
            };
            applier.join().unwrap();
            deleter.join().unwrap();

            // the definition and the agent's desired set agree
            let defined = r.definitions().first().map(|d| spec_hash(&d.spec).unwrap());
            let desired = r.desired_for("a").unwrap().get("fleet-fleetset-web").map(|e| e.hash.clone());
            assert_eq!(defined, desired);
        }
    }

    #[test]
    fn test_targets_count_selected_agents() {
        let r = Reconciler::with_definitions(vec![def("web", "nginx"), zoned("edge", "b")]).unwrap();
        r.add_host("a", &labels("a"));
        r.add_host("b", &labels("b"));

        let targets = r.targets();
        assert_eq!(targets.len(), 2);
        let edge = targets.iter().find(|t| t.key == "fleet-fleetset-edge").unwrap();
        assert_eq!(edge.desired, 1);
        let web = targets.iter().find(|t| t.key == "fleet-fleetset-web").unwrap();
        assert_eq!(web.desired, 2);
        assert_eq!(web.hash, spec_hash(&web.definition.spec).unwrap());
    }

    #[test]
    fn test_relabel_adds_newly_selected() {
        let r = Reconciler::with_definitions(vec![zoned("edge", "b")]).unwrap();
        assert!(r.add_host("a", &labels("a")).is_empty());
        let cmds = r.add_host("a", &labels("b"));
        assert_eq!(cmds.len(), 1);
        assert_eq!(r.desired_commands("a").len(), 1);

        assert!(r.add_host("a", &labels("a")).is_empty());
        assert!(r.desired_commands("a").is_empty());
    }
}
