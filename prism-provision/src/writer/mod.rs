//! Cluster state publication
//!
//! A collection record is written in one of two ways, fixed per collection
//! when it is created:
//!
//! - **Queued**: mutations are appended to the state-update queue and the
//!   [`Overseer`] applies them. Replica states live in the collection record.
//! - **Direct**: the caller rewrites the collection record itself with a
//!   conditional write and retries on conflict. Replica states live in
//!   per-replica records under `replica_states/`, so a node reporting its
//!   state never touches the collection record.

mod mutator;
mod overseer;
mod queue;

pub use mutator::{
    add_replica, modify_collection, set_replica_state, AddReplicaOp, CollectionModification, MutationError,
    StateMutation,
};
pub use overseer::Overseer;
pub use queue::{QueueEntry, StateUpdateQueue};

use crate::error::{ProvisionError, Result};
use crate::metrics;
use crate::state::{encode_collection, load_collection};
use crate::store::{paths, put_json, write_json, CreateMode, DistributedStore, StoreError};
use crate::types::{Collection, Replica, ReplicaState};
use std::sync::Arc;
use tracing::{debug, warn};

/// How a collection's state is published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateProtocol {
    Queued,
    Direct,
}

impl StateProtocol {
    pub fn from_flag(per_replica_state: bool) -> Self {
        if per_replica_state {
            StateProtocol::Direct
        } else {
            StateProtocol::Queued
        }
    }

    pub fn of(collection: &Collection) -> Self {
        Self::from_flag(collection.per_replica_state)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StateProtocol::Queued => "queued",
            StateProtocol::Direct => "direct",
        }
    }
}

/// Writes collection records using the collection's protocol
#[derive(Clone)]
pub struct ClusterStateWriter {
    store: Arc<dyn DistributedStore>,
    queue: StateUpdateQueue,
    max_cas_retries: usize,
}

impl ClusterStateWriter {
    pub fn new(store: Arc<dyn DistributedStore>, max_cas_retries: usize) -> Self {
        Self {
            queue: StateUpdateQueue::new(store.clone()),
            store,
            max_cas_retries,
        }
    }

    pub fn queue(&self) -> &StateUpdateQueue {
        &self.queue
    }

    /// Publish the initial record of a new collection
    pub async fn publish_initial(&self, collection: &Collection) -> Result<()> {
        match StateProtocol::of(collection) {
            StateProtocol::Queued => {
                self.queue
                    .offer(&StateMutation::CreateCollection(collection.clone()))
                    .await?;
                Ok(())
            }
            StateProtocol::Direct => {
                let path = paths::collection_state(&collection.name);
                match self
                    .store
                    .make_path(&path, encode_collection(collection)?, CreateMode::Persistent)
                    .await
                {
                    Ok(_) => {
                        metrics::record_state_mutation("create_collection", "applied");
                        Ok(())
                    }
                    Err(StoreError::NodeExists(_)) => Err(ProvisionError::CollectionExists(collection.name.clone())),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Register a replica. The direct protocol returns the registered
    /// replica; the queued protocol returns `None` since the overseer
    /// assigns it later.
    pub async fn publish_replica(&self, protocol: StateProtocol, op: &AddReplicaOp) -> Result<Option<Replica>> {
        match protocol {
            StateProtocol::Queued => {
                self.queue.offer(&StateMutation::AddReplica(op.clone())).await?;
                Ok(None)
            }
            StateProtocol::Direct => {
                let updated = self
                    .update_collection(&op.collection, |c| mutator::add_replica(c, op))
                    .await?;
                let replica = updated.replica_by_core(&op.core).cloned();
                if let Some(replica) = &replica {
                    write_json(
                        self.store.as_ref(),
                        &paths::replica_state(&op.collection, &replica.name),
                        &replica.state,
                    )
                    .await?;
                }
                Ok(replica)
            }
        }
    }

    /// Record a replica's state
    pub async fn set_replica_state(
        &self,
        protocol: StateProtocol,
        collection: &str,
        replica: &Replica,
        state: ReplicaState,
    ) -> Result<()> {
        match protocol {
            StateProtocol::Queued => {
                self.queue
                    .offer(&StateMutation::SetReplicaState {
                        collection: collection.to_string(),
                        core: replica.core.clone(),
                        state,
                    })
                    .await?;
            }
            StateProtocol::Direct => {
                // Registration created the parent; a deleted collection rejects late reports
                put_json(
                    self.store.as_ref(),
                    &paths::replica_state(collection, &replica.name),
                    &state,
                )
                .await?;
            }
        }
        Ok(())
    }

    pub async fn modify_collection(
        &self,
        protocol: StateProtocol,
        collection: &str,
        modification: &CollectionModification,
    ) -> Result<()> {
        match protocol {
            StateProtocol::Queued => {
                self.queue
                    .offer(&StateMutation::ModifyCollection {
                        collection: collection.to_string(),
                        modification: modification.clone(),
                    })
                    .await?;
            }
            StateProtocol::Direct => {
                self.update_collection(collection, |c| Ok(mutator::modify_collection(c, modification)))
                    .await?;
            }
        }
        Ok(())
    }

    /// Remove the collection record and any per-replica records
    pub async fn delete_collection(&self, protocol: StateProtocol, collection: &str) -> Result<()> {
        match protocol {
            StateProtocol::Queued => {
                self.queue
                    .offer(&StateMutation::DeleteCollection {
                        collection: collection.to_string(),
                    })
                    .await?;
            }
            StateProtocol::Direct => {
                self.store.delete_recursive(&paths::replica_states(collection)).await?;
                match self.store.delete(&paths::collection_state(collection), None).await {
                    Ok(()) | Err(StoreError::NoNode(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Read-modify-write of a collection record with version checks
    async fn update_collection<F>(&self, name: &str, f: F) -> Result<Collection>
    where
        F: Fn(&Collection) -> std::result::Result<Collection, MutationError>,
    {
        let path = paths::collection_state(name);
        let mut attempt = 0;
        loop {
            let (current, version) = load_collection(self.store.as_ref(), name)
                .await?
                .ok_or_else(|| MutationError::CollectionNotFound(name.to_string()))?;
            let next = f(&current)?;
            match self.store.set(&path, encode_collection(&next)?, Some(version)).await {
                Ok(new_version) => {
                    debug!(collection = %name, version = new_version, "Updated collection record");
                    return Ok(next);
                }
                Err(StoreError::BadVersion { expected, actual, .. }) if attempt < self.max_cas_retries => {
                    attempt += 1;
                    metrics::record_cas_conflict();
                    debug!(
                        collection = %name,
                        expected,
                        actual,
                        attempt,
                        "Collection record changed concurrently, retrying"
                    );
                }
                Err(e) => {
                    if matches!(e, StoreError::BadVersion { .. }) {
                        warn!(collection = %name, attempts = attempt + 1, "Giving up on collection record update");
                    }
                    return Err(e.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::load_replica_states;
    use crate::store::MemoryStore;
    use crate::types::{ReplicaType, Router, Shard};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn collection(name: &str, per_replica_state: bool) -> Collection {
        Collection {
            name: name.into(),
            router: Router::CompositeId,
            shards: vec![Shard::new("shard1", None), Shard::new("shard2", None)],
            config_name: "conf".into(),
            per_replica_state,
            max_shards_per_node: 1,
            nrt_replicas: 1,
            tlog_replicas: 0,
            pull_replicas: 0,
            colocated_with: None,
            with_collection: None,
            properties: BTreeMap::new(),
        }
    }

    fn op(collection: &str, shard: &str, core: &str) -> AddReplicaOp {
        AddReplicaOp {
            collection: collection.into(),
            shard: shard.into(),
            core: core.into(),
            replica_name: None,
            node_name: "node-a".into(),
            base_url: "http://node-a".into(),
            replica_type: ReplicaType::Nrt,
            state: ReplicaState::Down,
        }
    }

    #[test]
    fn test_protocol_from_flag() {
        assert_eq!(StateProtocol::from_flag(true), StateProtocol::Direct);
        assert_eq!(StateProtocol::of(&collection("a", false)), StateProtocol::Queued);
    }

    #[tokio::test]
    async fn test_direct_protocol() {
        let store = Arc::new(MemoryStore::new());
        let writer = ClusterStateWriter::new(store.clone(), 5);
        let foo = collection("foo", true);

        writer.publish_initial(&foo).await.unwrap();
        assert!(matches!(
            writer.publish_initial(&foo).await,
            Err(ProvisionError::CollectionExists(_))
        ));

        let replica = writer
            .publish_replica(StateProtocol::Direct, &op("foo", "shard1", "foo_shard1_replica_n1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replica.name, "core_node1");

        writer
            .set_replica_state(StateProtocol::Direct, "foo", &replica, ReplicaState::Active)
            .await
            .unwrap();
        let states = load_replica_states(store.as_ref(), "foo").await.unwrap();
        assert_eq!(states.get("core_node1"), Some(&ReplicaState::Active));

        // The collection record itself keeps the registration state
        let (record, _) = load_collection(store.as_ref(), "foo").await.unwrap().unwrap();
        assert_eq!(record.replica_by_core("foo_shard1_replica_n1").unwrap().state, ReplicaState::Down);

        writer.delete_collection(StateProtocol::Direct, "foo").await.unwrap();
        assert!(load_collection(store.as_ref(), "foo").await.unwrap().is_none());
        assert!(load_replica_states(store.as_ref(), "foo").await.unwrap().is_empty());

        // A report arriving after the delete must not bring the records back
        let late = writer
            .set_replica_state(StateProtocol::Direct, "foo", &replica, ReplicaState::Active)
            .await;
        assert!(late.is_err());
        assert!(!store.exists(&paths::replica_states("foo")).await.unwrap());
    }

    #[tokio::test]
    async fn test_direct_missing_collection() {
        let writer = ClusterStateWriter::new(Arc::new(MemoryStore::new()), 5);
        let result = writer
            .publish_replica(StateProtocol::Direct, &op("nope", "shard1", "core"))
            .await;
        assert!(matches!(
            result,
            Err(ProvisionError::Mutation(MutationError::CollectionNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_direct_registrations() {
        let store = Arc::new(MemoryStore::new());
        let writer = ClusterStateWriter::new(store.clone(), 50);
        writer.publish_initial(&collection("foo", true)).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                let shard = if i % 2 == 0 { "shard1" } else { "shard2" };
                writer
                    .publish_replica(StateProtocol::Direct, &op("foo", shard, &format!("core{}", i)))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let (record, _) = load_collection(store.as_ref(), "foo").await.unwrap().unwrap();
        assert_eq!(record.replica_count(), 8);
        let names: std::collections::BTreeSet<_> = record.replicas().map(|r| r.name.clone()).collect();
        assert_eq!(names.len(), 8);
    }

    #[tokio::test]
    async fn test_queued_protocol_goes_through_overseer() {
        let store = Arc::new(MemoryStore::new());
        let writer = ClusterStateWriter::new(store.clone(), 5);
        let overseer = Overseer::new(store.clone(), Duration::from_millis(10));
        let foo = collection("foo", false);

        writer.publish_initial(&foo).await.unwrap();
        let registered = writer
            .publish_replica(StateProtocol::Queued, &op("foo", "shard2", "foo_shard2_replica_n1"))
            .await
            .unwrap();
        assert!(registered.is_none());
        assert!(load_collection(store.as_ref(), "foo").await.unwrap().is_none());
        assert_eq!(writer.queue().len().await.unwrap(), 2);

        overseer.process_pending().await.unwrap();
        let (record, _) = load_collection(store.as_ref(), "foo").await.unwrap().unwrap();
        assert_eq!(record.shard("shard2").unwrap().replicas.len(), 1);

        writer
            .modify_collection(
                StateProtocol::Queued,
                "foo",
                &CollectionModification {
                    colocated_with: Some("bar".into()),
                    properties: BTreeMap::new(),
                },
            )
            .await
            .unwrap();
        overseer.process_pending().await.unwrap();
        let (record, _) = load_collection(store.as_ref(), "foo").await.unwrap().unwrap();
        assert_eq!(record.colocated_with.as_deref(), Some("bar"));
    }
}
