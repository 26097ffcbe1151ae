//! Placement sessions
//!
//! Concurrent collection creations must not pick nodes without seeing each
//! other. Each run takes a [`SessionLease`] from the shared
//! [`PlacementSessions`] pool, reserves the positions it computed, and
//! releases the lease when it finishes. Placement treats reservations of
//! other leases as load on their nodes until their replicas show up in the
//! cluster state.

use super::ReplicaPosition;
use crate::state::ClusterStateView;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

struct Reservation {
    collection: String,
    positions: Vec<ReplicaPosition>,
}

#[derive(Default)]
struct SessionsInner {
    next_id: u64,
    leases: HashMap<u64, Reservation>,
}

/// Shared pool of placement leases
#[derive(Default)]
pub struct PlacementSessions {
    inner: Mutex<SessionsInner>,
}

impl PlacementSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a lease for a placement run on `collection`
    pub fn acquire(self: &Arc<Self>, collection: &str) -> SessionLease {
        let (id, active) = {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let id = inner.next_id;
            inner.leases.insert(
                id,
                Reservation {
                    collection: collection.to_string(),
                    positions: Vec::new(),
                },
            );
            (id, inner.leases.len())
        };
        crate::metrics::update_active_leases(active);
        debug!(lease = id, collection = %collection, "Acquired placement lease");
        SessionLease {
            id,
            collection: collection.to_string(),
            sessions: self.clone(),
            released: false,
        }
    }

    /// Number of leases not yet released
    pub fn active_leases(&self) -> usize {
        self.inner.lock().leases.len()
    }

    /// Total replicas reserved across all open leases
    pub fn reserved_replicas(&self) -> usize {
        self.inner.lock().leases.values().map(|r| r.positions.len()).sum()
    }

    fn reservations_except(&self, id: u64) -> Vec<(String, Vec<ReplicaPosition>)> {
        self.inner
            .lock()
            .leases
            .iter()
            .filter(|(lease, _)| **lease != id)
            .map(|(_, r)| (r.collection.clone(), r.positions.clone()))
            .collect()
    }

    fn reserve(&self, id: u64, positions: &[ReplicaPosition]) {
        if let Some(reservation) = self.inner.lock().leases.get_mut(&id) {
            reservation.positions.extend_from_slice(positions);
        }
    }

    fn release(&self, id: u64) -> bool {
        let (removed, active) = {
            let mut inner = self.inner.lock();
            let removed = inner.leases.remove(&id).is_some();
            (removed, inner.leases.len())
        };
        crate::metrics::update_active_leases(active);
        removed
    }
}

/// A placement run's hold on the session pool; released exactly once,
/// either explicitly or on drop
pub struct SessionLease {
    id: u64,
    collection: String,
    sessions: Arc<PlacementSessions>,
    released: bool,
}

impl SessionLease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Cores per node reserved by other runs whose replicas are not yet in `view`
    ///
    /// A reserved position stops counting once `view` holds a replica of the
    /// same shard on the same node; the rest of that run still counts.
    pub fn in_flight_cores(&self, view: &dyn ClusterStateView) -> HashMap<String, usize> {
        let mut cores = HashMap::new();
        for (collection, positions) in self.sessions.reservations_except(self.id) {
            let mut visible: HashMap<(&str, &str), usize> = HashMap::new();
            if let Some(existing) = view.collection(&collection) {
                for replica in existing.replicas() {
                    *visible
                        .entry((replica.shard.as_str(), replica.node_name.as_str()))
                        .or_insert(0) += 1;
                }
            }
            for position in &positions {
                if let Some(seen) = visible.get_mut(&(position.shard.as_str(), position.node.as_str())) {
                    if *seen > 0 {
                        *seen -= 1;
                        continue;
                    }
                }
                *cores.entry(position.node.clone()).or_insert(0) += 1;
            }
        }
        cores
    }

    /// Record positions computed under this lease
    pub fn reserve(&self, positions: &[ReplicaPosition]) {
        self.sessions.reserve(self.id, positions);
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.sessions.release(self.id) {
            debug!(lease = self.id, collection = %self.collection, "Released placement lease");
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.release_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReplicaType;

    fn position(shard: &str, node: &str) -> ReplicaPosition {
        ReplicaPosition {
            shard: shard.to_string(),
            index: 0,
            replica_type: ReplicaType::Nrt,
            node: node.to_string(),
        }
    }

    #[test]
    fn test_release_explicit_and_drop() {
        let sessions = Arc::new(PlacementSessions::new());
        let first = sessions.acquire("a");
        let second = sessions.acquire("b");
        assert_eq!(sessions.active_leases(), 2);
        assert_ne!(first.id(), second.id());

        first.release();
        assert_eq!(sessions.active_leases(), 1);

        drop(second);
        assert_eq!(sessions.active_leases(), 0);
    }

    #[test]
    fn test_released_on_early_return() {
        fn failing_run(sessions: &Arc<PlacementSessions>) -> Result<(), &'static str> {
            let _lease = sessions.acquire("c");
            Err("placement failed")
        }

        let sessions = Arc::new(PlacementSessions::new());
        assert!(failing_run(&sessions).is_err());
        assert_eq!(sessions.active_leases(), 0);
    }

    #[test]
    fn test_in_flight_excludes_own_reservations() {
        let sessions = Arc::new(PlacementSessions::new());
        let mine = sessions.acquire("mine");
        let other = sessions.acquire("other");
        mine.reserve(&[position("shard1", "a")]);
        other.reserve(&[position("shard1", "a"), position("shard2", "b")]);

        let view = crate::state::ClusterState::new();
        let in_flight = mine.in_flight_cores(&view);
        assert_eq!(in_flight.get("a"), Some(&1));
        assert_eq!(in_flight.get("b"), Some(&1));
        assert_eq!(sessions.reserved_replicas(), 3);
    }

    #[test]
    fn test_in_flight_counts_positions_not_yet_visible() {
        use crate::types::{Collection, Replica, ReplicaState, Router, Shard};
        use std::collections::BTreeMap;

        let sessions = Arc::new(PlacementSessions::new());
        let mine = sessions.acquire("mine");
        let other = sessions.acquire("other");
        other.reserve(&[position("shard1", "a"), position("shard2", "b")]);

        let mut shard1 = Shard::new("shard1", None);
        shard1.replicas.insert(
            "core_node1".into(),
            Replica {
                name: "core_node1".into(),
                core: "other_shard1_replica_n1".into(),
                shard: "shard1".into(),
                node_name: "a".into(),
                base_url: "http://a".into(),
                replica_type: ReplicaType::Nrt,
                state: ReplicaState::Down,
            },
        );
        let collection = Collection {
            name: "other".into(),
            router: Router::Implicit,
            shards: vec![shard1, Shard::new("shard2", None)],
            config_name: "conf".into(),
            per_replica_state: false,
            max_shards_per_node: -1,
            nrt_replicas: 1,
            tlog_replicas: 0,
            pull_replicas: 0,
            colocated_with: None,
            with_collection: None,
            properties: BTreeMap::new(),
        };
        let view = crate::state::ClusterState::new().with_collection(collection);

        let in_flight = mine.in_flight_cores(&view);
        assert_eq!(in_flight.get("a"), None);
        assert_eq!(in_flight.get("b"), Some(&1));
    }
}
