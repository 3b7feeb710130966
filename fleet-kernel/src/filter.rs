/**
 * HEARTBEAT FILTER - Garde d'ordre par agent (seqnum, timestamp)
 *
 * RÔLE : seule défense contre les doublons et les heartbeats hors d'ordre
 * livrés par un agent qui se reconnecte ou réessaie.
 *
 * FONCTIONNEMENT : rejet si seq < stocké ; rejet si seq égal et timestamp <= stocké ;
 * sinon acceptation et écrasement. Décision prise sous le verrou de l'entrée
 * de l'agent (shard DashMap), les autres agents ne sont pas bloqués.
 */

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fleet_proto::HeartbeatRecord;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterEntry {
    pub seqnum: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Accepted,
    /// seqnum plus ancien que le dernier accepté
    StaleSeq { stored: u64 },
    /// même seqnum, timestamp pas plus récent
    StaleTimestamp { stored: i64 },
}

impl FilterDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FilterDecision::Accepted)
    }
}

#[derive(Debug, Default)]
pub struct HeartbeatFilter {
    entries: DashMap<String, FilterEntry>,
}

impl HeartbeatFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&self, record: &HeartbeatRecord) -> bool {
        self.decide(&record.name, record.seqnum, record.timestamp).is_accepted()
    }

    pub fn decide(&self, name: &str, seqnum: u64, timestamp: i64) -> FilterDecision {
        let incoming = FilterEntry { seqnum, timestamp };
        match self.entries.entry(name.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(incoming);
                FilterDecision::Accepted
            }
            Entry::Occupied(mut slot) => {
                let stored = *slot.get();
                if seqnum < stored.seqnum {
                    warn!(
                        "drop heartbeat from {}: seqnum {} < {}",
                        name, seqnum, stored.seqnum
                    );
                    return FilterDecision::StaleSeq { stored: stored.seqnum };
                }
                if seqnum == stored.seqnum && timestamp <= stored.timestamp {
                    debug!(
                        "drop heartbeat from {}: timestamp {} <= {}",
                        name, timestamp, stored.timestamp
                    );
                    return FilterDecision::StaleTimestamp { stored: stored.timestamp };
                }
                slot.insert(incoming);
                FilterDecision::Accepted
            }
        }
    }

    /// Remplace l'entrée sans contrôle (reconstruction depuis un snapshot).
    pub fn seed(&self, name: &str, seqnum: u64, timestamp: i64) {
        self.entries.insert(name.to_string(), FilterEntry { seqnum, timestamp });
    }

    pub fn get(&self, name: &str) -> Option<FilterEntry> {
        self.entries.get(name).map(|e| *e)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_first_heartbeat_accepted() {
        let f = HeartbeatFilter::new();
        assert_eq!(f.decide("a", 5, 100), FilterDecision::Accepted);
        assert_eq!(f.get("a"), Some(FilterEntry { seqnum: 5, timestamp: 100 }));
    }

    #[test]
    fn test_lower_seq_rejected() {
        let f = HeartbeatFilter::new();
        f.decide("a", 5, 100);
        assert_eq!(f.decide("a", 4, 999), FilterDecision::StaleSeq { stored: 5 });
        assert_eq!(f.get("a").unwrap().timestamp, 100);
    }

    #[test]
    fn test_equal_seq_needs_newer_timestamp() {
        let f = HeartbeatFilter::new();
        f.decide("a", 5, 100);
        assert_eq!(f.decide("a", 5, 100), FilterDecision::StaleTimestamp { stored: 100 });
        assert_eq!(f.decide("a", 5, 99), FilterDecision::StaleTimestamp { stored: 100 });
        assert!(f.decide("a", 5, 101).is_accepted());
    }

    #[test]
    fn test_higher_seq_accepted_even_with_older_timestamp() {
        // agent restarted with a skewed clock
        let f = HeartbeatFilter::new();
        f.decide("a", 5, 100);
        assert!(f.decide("a", 6, 1).is_accepted());
    }

    #[test]
    fn test_agents_are_independent() {
        let f = HeartbeatFilter::new();
        f.decide("a", 10, 100);
        assert!(f.decide("b", 1, 1).is_accepted());
        assert_eq!(f.len(), 2);
    }

    fn accepted_in_order(f: &HeartbeatFilter, pairs: &[(u64, i64)]) -> Vec<(u64, i64)> {
        pairs
            .iter()
            .copied()
            .filter(|&(s, t)| f.decide("n", s, t).is_accepted())
            .collect()
    }

    proptest! {
        #[test]
        fn test_accepted_stream_is_monotonic(pairs in prop::collection::vec((0u64..20, 0i64..50), 1..60)) {
            let f = HeartbeatFilter::new();
            let accepted = accepted_in_order(&f, &pairs);
            for w in accepted.windows(2) {
                let (s0, t0) = w[0];
                let (s1, t1) = w[1];
                prop_assert!(s1 >= s0);
                if s1 == s0 {
                    prop_assert!(t1 > t0);
                }
            }
        }

        #[test]
        fn test_final_entry_is_maximum(pairs in prop::collection::vec((0u64..20, 0i64..50), 1..60)) {
            // whatever the delivery order, the filter ends on the greatest (seq, ts) pair
            let f = HeartbeatFilter::new();
            accepted_in_order(&f, &pairs);
            let max = pairs.iter().copied().max().unwrap();
            prop_assert_eq!(f.get("n"), Some(FilterEntry { seqnum: max.0, timestamp: max.1 }));
        }

        #[test]
        fn test_sorted_delivery_accepts_every_distinct_pair(pairs in prop::collection::vec((0u64..20, 0i64..50), 1..60)) {
            let mut sorted = pairs.clone();
            sorted.sort();
            sorted.dedup();
            let f = HeartbeatFilter::new();
            prop_assert_eq!(accepted_in_order(&f, &sorted), sorted.clone());
        }
    }
}
