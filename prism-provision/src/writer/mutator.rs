//! Pure collection-record mutations
//!
//! Both publication protocols apply these to a complete collection record
//! and write the whole result back. Nothing here touches the store.

use crate::types::{Collection, Replica, ReplicaState, ReplicaType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// A mutation that cannot be applied to the current record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    #[error("Shard {shard} not found in collection {collection}")]
    ShardNotFound { collection: String, shard: String },

    #[error("Core {core} already registered in collection {collection}")]
    CoreExists { collection: String, core: String },

    #[error("Core {core} not found in collection {collection}")]
    ReplicaNotFound { collection: String, core: String },
}

/// Registration of one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddReplicaOp {
    pub collection: String,
    pub shard: String,
    pub core: String,
    /// Assigned from the collection's next free name when absent
    pub replica_name: Option<String>,
    pub node_name: String,
    pub base_url: String,
    pub replica_type: ReplicaType,
    pub state: ReplicaState,
}

/// Changes to collection-level fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionModification {
    pub colocated_with: Option<String>,
    pub properties: BTreeMap<String, String>,
}

/// Message type of the state-update queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateMutation {
    CreateCollection(Collection),
    AddReplica(AddReplicaOp),
    SetReplicaState {
        collection: String,
        core: String,
        state: ReplicaState,
    },
    ModifyCollection {
        collection: String,
        modification: CollectionModification,
    },
    DeleteCollection {
        collection: String,
    },
}

impl StateMutation {
    /// Label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            StateMutation::CreateCollection(_) => "create_collection",
            StateMutation::AddReplica(_) => "add_replica",
            StateMutation::SetReplicaState { .. } => "set_replica_state",
            StateMutation::ModifyCollection { .. } => "modify_collection",
            StateMutation::DeleteCollection { .. } => "delete_collection",
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            StateMutation::CreateCollection(c) => &c.name,
            StateMutation::AddReplica(op) => &op.collection,
            StateMutation::SetReplicaState { collection, .. }
            | StateMutation::ModifyCollection { collection, .. }
            | StateMutation::DeleteCollection { collection } => collection,
        }
    }
}

/// Add a replica to its shard
pub fn add_replica(collection: &Collection, op: &AddReplicaOp) -> Result<Collection, MutationError> {
    if collection.replica_by_core(&op.core).is_some() {
        return Err(MutationError::CoreExists {
            collection: collection.name.clone(),
            core: op.core.clone(),
        });
    }
    let name = op
        .replica_name
        .clone()
        .unwrap_or_else(|| collection.next_replica_name());

    let mut next = collection.clone();
    let shard = next.shard_mut(&op.shard).ok_or_else(|| MutationError::ShardNotFound {
        collection: collection.name.clone(),
        shard: op.shard.clone(),
    })?;
    shard.replicas.insert(
        name.clone(),
        Replica {
            name,
            core: op.core.clone(),
            shard: op.shard.clone(),
            node_name: op.node_name.clone(),
            base_url: op.base_url.clone(),
            replica_type: op.replica_type,
            state: op.state,
        },
    );
    Ok(next)
}

/// Set the state of the replica hosted by `core`
pub fn set_replica_state(collection: &Collection, core: &str, state: ReplicaState) -> Result<Collection, MutationError> {
    let mut next = collection.clone();
    let replica = next
        .shards
        .iter_mut()
        .flat_map(|s| s.replicas.values_mut())
        .find(|r| r.core == core)
        .ok_or_else(|| MutationError::ReplicaNotFound {
            collection: collection.name.clone(),
            core: core.to_string(),
        })?;
    replica.state = state;
    Ok(next)
}

pub fn modify_collection(collection: &Collection, modification: &CollectionModification) -> Collection {
    let mut next = collection.clone();
    if let Some(colocated) = &modification.colocated_with {
        next.colocated_with = Some(colocated.clone());
    }
    for (key, value) in &modification.properties {
        next.properties.insert(key.clone(), value.clone());
    }
    next
}
