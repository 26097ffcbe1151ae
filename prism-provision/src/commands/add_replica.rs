//! Add one replica to an existing collection
//!
//! Used by collection creation to put a replica of the companion collection
//! on every node that receives a replica of the new one.

use super::{allocate_core_name, CommandContext};
use crate::error::{NodeFailure, ProvisionError, Result};
use crate::request::CoreAck;
use crate::rpc::CreateCoreRequest;
use crate::state::ClusterStateView;
use crate::types::{Replica, ReplicaState, ReplicaType};
use crate::writer::{AddReplicaOp, StateProtocol};
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddReplicaRequest {
    pub collection: String,
    pub shard: String,
    pub node: String,
    pub replica_type: ReplicaType,
    /// Wait until the new replica reports ACTIVE
    pub wait_for_final_state: bool,
    pub properties: BTreeMap<String, String>,
}

impl AddReplicaRequest {
    pub fn new(collection: impl Into<String>, shard: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            shard: shard.into(),
            node: node.into(),
            replica_type: ReplicaType::Nrt,
            wait_for_final_state: false,
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddReplicaResponse {
    pub node: String,
    pub ack: CoreAck,
}

pub struct AddReplicaCmd<'a> {
    ctx: &'a CommandContext,
}

impl<'a> AddReplicaCmd<'a> {
    pub fn new(ctx: &'a CommandContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, request: &AddReplicaRequest) -> Result<AddReplicaResponse> {
        let state = self.ctx.reader.refresh().await?;
        let collection = state
            .collection(&request.collection)
            .ok_or_else(|| ProvisionError::InvalidRequest(format!("Collection not found: {}", request.collection)))?;
        if collection.shard(&request.shard).is_none() {
            return Err(ProvisionError::InvalidRequest(format!(
                "Shard {} does not exist in collection {}",
                request.shard, request.collection
            )));
        }
        if !state.live_nodes().contains(&request.node) {
            return Err(ProvisionError::InvalidRequest(format!(
                "Node {} is not live",
                request.node
            )));
        }
        let protocol = StateProtocol::of(collection);
        let config_name = collection.config_name.clone();
        let num_shards = collection.shards.len() as u32;

        let core = allocate_core_name(
            self.ctx.store.as_ref(),
            &request.collection,
            &request.shard,
            request.replica_type,
            self.ctx.config.max_cas_retries,
        )
        .await?;
        let op = AddReplicaOp {
            collection: request.collection.clone(),
            shard: request.shard.clone(),
            core: core.clone(),
            replica_name: None,
            node_name: request.node.clone(),
            base_url: self.ctx.nodes.base_url(&request.node).await?,
            replica_type: request.replica_type,
            state: ReplicaState::Down,
        };
        let replica = self.register(protocol, &op).await?;
        debug!(collection = %request.collection, core = %core, replica = %replica.name, "Registered replica");

        let create = CreateCoreRequest {
            core: core.clone(),
            collection: request.collection.clone(),
            shard: request.shard.clone(),
            replica_type: request.replica_type,
            config_name,
            num_shards,
            replica_name: Some(replica.name.clone()),
            async_id: None,
            properties: request.properties.clone(),
        };
        self.ctx
            .core_admin
            .create_core(&request.node, create)
            .await
            .map_err(|e| ProvisionError::ProvisioningFailed {
                collection: request.collection.clone(),
                failures: vec![NodeFailure::new(&request.node, &core, e.to_string())],
            })?;

        if request.wait_for_final_state {
            let active = self
                .ctx
                .wait_for_state(self.ctx.config.active_poll(), |s| {
                    s.collection(&request.collection)
                        .and_then(|c| c.replica_by_core(&core))
                        .map(|r| r.state == ReplicaState::Active)
                        .unwrap_or(false)
                })
                .await?;
            if active.is_none() {
                return Err(ProvisionError::ProvisioningFailed {
                    collection: request.collection.clone(),
                    failures: vec![NodeFailure::new(&request.node, &core, "replica did not become active")],
                });
            }
        }

        info!(
            collection = %request.collection,
            shard = %request.shard,
            node = %request.node,
            core = %core,
            "Added replica"
        );
        Ok(AddReplicaResponse {
            node: request.node.clone(),
            ack: CoreAck {
                core,
                replica_name: Some(replica.name),
                async_id: None,
            },
        })
    }

    /// Register the replica and return it as recorded
    async fn register(&self, protocol: StateProtocol, op: &AddReplicaOp) -> Result<Replica> {
        if let Some(replica) = self.ctx.writer.publish_replica(protocol, op).await? {
            return Ok(replica);
        }
        let state = self
            .ctx
            .wait_for_state(self.ctx.config.visibility_poll(), |s| {
                s.collection(&op.collection)
                    .and_then(|c| c.replica_by_core(&op.core))
                    .is_some()
            })
            .await?
            .ok_or_else(|| {
                ProvisionError::Server(format!(
                    "Timed out waiting for replica {} of {} to appear in the cluster state",
                    op.core, op.collection
                ))
            })?;
        state
            .collection(&op.collection)
            .and_then(|c| c.replica_by_core(&op.core))
            .cloned()
            .ok_or_else(|| ProvisionError::Server(format!("replica {} disappeared", op.core)))
    }
}
