//! In-process node agents
//!
//! A [`NodeAgent`] plays the node side of core administration: it keeps the
//! cores hosted on one node and, once a core is up, reports the replica as
//! ACTIVE through whichever protocol the collection uses.

use super::{AsyncStatus, CoreAdmin, CoreAdminResponse, CreateCoreRequest, UnloadCoreRequest};
use crate::error::RpcError;
use crate::state::load_collection;
use crate::store::DistributedStore;
use crate::types::{ReplicaState, ReplicaType};
use crate::writer::{ClusterStateWriter, StateProtocol};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A core hosted by a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedCore {
    pub collection: String,
    pub shard: String,
    pub replica_name: String,
    pub replica_type: ReplicaType,
    pub config_name: String,
    pub properties: BTreeMap<String, String>,
}

pub struct NodeAgent {
    node: String,
    store: Arc<dyn DistributedStore>,
    writer: ClusterStateWriter,
    cores: RwLock<BTreeMap<String, HostedCore>>,
    async_requests: RwLock<HashMap<String, AsyncStatus>>,
    fail_creates: AtomicBool,
    report_active: AtomicBool,
}

impl NodeAgent {
    pub fn new(node: impl Into<String>, store: Arc<dyn DistributedStore>, max_cas_retries: usize) -> Self {
        Self {
            node: node.into(),
            writer: ClusterStateWriter::new(store.clone(), max_cas_retries),
            store,
            cores: RwLock::new(BTreeMap::new()),
            async_requests: RwLock::new(HashMap::new()),
            fail_creates: AtomicBool::new(false),
            report_active: AtomicBool::new(true),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Make every subsequent core creation fail
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Whether created cores report ACTIVE; when off they stay DOWN
    pub fn set_report_active(&self, report: bool) {
        self.report_active.store(report, Ordering::SeqCst);
    }

    pub fn hosted_cores(&self) -> Vec<String> {
        self.cores.read().keys().cloned().collect()
    }

    pub fn core(&self, name: &str) -> Option<HostedCore> {
        self.cores.read().get(name).cloned()
    }

    pub fn core_count(&self) -> usize {
        self.cores.read().len()
    }

    pub async fn create_core(&self, request: CreateCoreRequest) -> Result<CoreAdminResponse, RpcError> {
        let outcome = self.do_create_core(&request).await;

        match (&request.async_id, outcome) {
            (Some(async_id), outcome) => {
                let status = match outcome {
                    Ok(()) => AsyncStatus::Completed,
                    Err(e) => AsyncStatus::Failed(e.to_string()),
                };
                self.async_requests.write().insert(async_id.clone(), status);
                Ok(CoreAdminResponse {
                    node: self.node.clone(),
                    core: request.core,
                    async_id: Some(async_id.clone()),
                })
            }
            (None, Ok(())) => Ok(CoreAdminResponse {
                node: self.node.clone(),
                core: request.core,
                async_id: None,
            }),
            (None, Err(e)) => Err(e),
        }
    }

    async fn do_create_core(&self, request: &CreateCoreRequest) -> Result<(), RpcError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(RpcError::CoreCreation(format!(
                "Error CREATEing core {} on {}",
                request.core, self.node
            )));
        }
        if self.cores.read().contains_key(&request.core) {
            return Err(RpcError::CoreExists(request.core.clone()));
        }

        // The replica has to be registered before its core can be created
        let (collection, _) = load_collection(self.store.as_ref(), &request.collection)
            .await
            .map_err(|e| RpcError::Internal(e.to_string()))?
            .ok_or_else(|| RpcError::CoreCreation(format!("collection {} does not exist", request.collection)))?;
        let replica = collection
            .replica_by_core(&request.core)
            .filter(|r| r.node_name == self.node)
            .cloned()
            .ok_or_else(|| {
                RpcError::CoreCreation(format!(
                    "no replica registered for core {} on {} in collection {}",
                    request.core, self.node, request.collection
                ))
            })?;
        if let Some(expected) = &request.replica_name {
            if expected != &replica.name {
                return Err(RpcError::CoreCreation(format!(
                    "core {} belongs to replica {}, not {}",
                    request.core, replica.name, expected
                )));
            }
        }

        self.cores.write().insert(
            request.core.clone(),
            HostedCore {
                collection: request.collection.clone(),
                shard: request.shard.clone(),
                replica_name: replica.name.clone(),
                replica_type: request.replica_type,
                config_name: request.config_name.clone(),
                properties: request.properties.clone(),
            },
        );
        info!(node = %self.node, core = %request.core, collection = %request.collection, "Created core");

        if self.report_active.load(Ordering::SeqCst) {
            self.writer
                .set_replica_state(
                    StateProtocol::of(&collection),
                    &collection.name,
                    &replica,
                    ReplicaState::Active,
                )
                .await
                .map_err(|e| RpcError::Internal(e.to_string()))?;
            debug!(node = %self.node, core = %request.core, "Reported replica active");
        }
        Ok(())
    }

    pub fn request_status(&self, async_id: &str) -> AsyncStatus {
        self.async_requests
            .read()
            .get(async_id)
            .cloned()
            .unwrap_or(AsyncStatus::NotFound)
    }

    pub fn unload_core(&self, request: &UnloadCoreRequest) -> Result<(), RpcError> {
        match self.cores.write().remove(&request.core) {
            Some(_) => {
                info!(
                    node = %self.node,
                    core = %request.core,
                    delete_index = request.delete_index,
                    "Unloaded core"
                );
                Ok(())
            }
            None => Err(RpcError::CoreNotFound(request.core.clone())),
        }
    }
}

/// [`CoreAdmin`] dispatching to in-process agents by node name
#[derive(Default)]
pub struct LocalCoreAdmin {
    agents: RwLock<HashMap<String, Arc<NodeAgent>>>,
}

impl LocalCoreAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_agent(&self, agent: Arc<NodeAgent>) {
        self.agents.write().insert(agent.node().to_string(), agent);
    }

    pub fn remove_agent(&self, node: &str) -> Option<Arc<NodeAgent>> {
        self.agents.write().remove(node)
    }

    pub fn agent(&self, node: &str) -> Option<Arc<NodeAgent>> {
        self.agents.read().get(node).cloned()
    }

    fn require(&self, node: &str) -> Result<Arc<NodeAgent>, RpcError> {
        self.agent(node)
            .ok_or_else(|| RpcError::NodeUnavailable(node.to_string()))
    }
}

#[async_trait]
impl CoreAdmin for LocalCoreAdmin {
    async fn create_core(&self, node: &str, request: CreateCoreRequest) -> Result<CoreAdminResponse, RpcError> {
        let agent = self.require(node)?;
        agent.create_core(request).await
    }

    async fn request_status(&self, node: &str, async_id: &str) -> Result<AsyncStatus, RpcError> {
        Ok(self.require(node)?.request_status(async_id))
    }

    async fn unload_core(&self, node: &str, request: UnloadCoreRequest) -> Result<(), RpcError> {
        let result = self.require(node)?.unload_core(&request);
        if let Err(e) = &result {
            warn!(node = %node, core = %request.core, error = %e, "Unload failed");
        }
        result
    }
}
