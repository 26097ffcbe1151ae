//! Single-process cluster
//!
//! [`LocalCluster`] wires an in-memory store, a running overseer and one
//! [`NodeAgent`] per node into a [`CommandContext`]. Core-admin calls go
//! straight to the agents, or through tarpc in-process channels when started
//! with [`LocalCluster::start_with_rpc`].

use crate::commands::{AddReplicaCmd, AddReplicaRequest, AddReplicaResponse, CommandContext, CreateCollectionCmd, DeleteCollectionCmd};
use crate::config::ProvisionConfig;
use crate::configset::StoreConfigSets;
use crate::error::Result;
use crate::nodes::StoreNodeDirectory;
use crate::request::{CreateCollectionRequest, CreateCollectionResponse};
use crate::rpc::{CoreAdmin, CoreAdminServer, LocalCoreAdmin, NodeAgent, RpcCoreAdmin};
use crate::store::{DistributedStore, MemoryStore};
use crate::types::NodeProperties;
use crate::writer::Overseer;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Files of the config set uploaded by [`LocalCluster::upload_config`]
const SAMPLE_CONFIG: &[(&str, &str)] = &[
    ("schema.json", r#"{"fields":{"id":{"type":"string"}}}"#),
    ("settings.json", r#"{"updateHandler":{"autoCommit":{"maxTime":15000}}}"#),
];

pub struct LocalCluster {
    store: Arc<MemoryStore>,
    directory: StoreNodeDirectory,
    local: Arc<LocalCoreAdmin>,
    rpc: Option<Arc<RpcCoreAdmin>>,
    overseer: Arc<Overseer>,
    overseer_handle: Option<JoinHandle<()>>,
    ctx: CommandContext,
}

impl LocalCluster {
    /// Cluster whose core-admin calls go directly to the node agents
    pub fn start(config: ProvisionConfig) -> Self {
        Self::build(config, false)
    }

    /// Cluster whose core-admin calls travel over tarpc channels
    pub fn start_with_rpc(config: ProvisionConfig) -> Self {
        Self::build(config, true)
    }

    fn build(config: ProvisionConfig, use_rpc: bool) -> Self {
        let store = Arc::new(MemoryStore::new());
        let shared: Arc<dyn DistributedStore> = store.clone();

        let local = Arc::new(LocalCoreAdmin::new());
        let rpc = use_rpc.then(|| Arc::new(RpcCoreAdmin::new(config.rpc_timeout())));
        let core_admin: Arc<dyn CoreAdmin> = match &rpc {
            Some(rpc) => rpc.clone(),
            None => local.clone(),
        };

        let overseer = Arc::new(Overseer::new(shared.clone(), config.poll_interval()));
        let overseer_handle = Some(overseer.clone().start());

        info!(node_id = %config.node_id, rpc = use_rpc, "Local cluster started");
        Self {
            directory: StoreNodeDirectory::new(shared.clone()),
            ctx: CommandContext::new(shared, core_admin, config),
            store,
            local,
            rpc,
            overseer,
            overseer_handle,
        }
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    pub fn context(&self) -> &CommandContext {
        &self.ctx
    }

    pub fn overseer(&self) -> Arc<Overseer> {
        self.overseer.clone()
    }

    /// Bring a node up: register it as live and start its agent
    pub async fn add_node(&self, node: &str, properties: NodeProperties) -> Result<Arc<NodeAgent>> {
        let agent = Arc::new(NodeAgent::new(node, self.ctx.store.clone(), self.ctx.config.max_cas_retries));
        self.local.add_agent(agent.clone());
        if let Some(rpc) = &self.rpc {
            let server = CoreAdminServer::new(agent.clone());
            rpc.add_client(node, server.serve_in_process());
        }
        self.directory.register(node, &properties).await?;
        Ok(agent)
    }

    /// Take a node down; its cores stay in the cluster state
    pub async fn remove_node(&self, node: &str) -> Result<()> {
        self.directory.deregister(node).await?;
        self.local.remove_agent(node);
        if let Some(rpc) = &self.rpc {
            rpc.remove_client(node);
        }
        Ok(())
    }

    pub fn agent(&self, node: &str) -> Option<Arc<NodeAgent>> {
        self.local.agent(node)
    }

    /// Upload a small config set under `name`
    pub async fn upload_config(&self, name: &str) -> Result<()> {
        let files: BTreeMap<String, Vec<u8>> = SAMPLE_CONFIG
            .iter()
            .map(|(file, content)| (file.to_string(), content.as_bytes().to_vec()))
            .collect();
        StoreConfigSets::new(self.ctx.store.clone()).upload(name, &files).await?;
        Ok(())
    }

    pub async fn create_collection(&self, request: &CreateCollectionRequest) -> Result<CreateCollectionResponse> {
        CreateCollectionCmd::new(&self.ctx).run(request).await
    }

    pub async fn delete_collection(&self, name: &str) -> Result<()> {
        DeleteCollectionCmd::new(&self.ctx).run(name).await
    }

    pub async fn add_replica(&self, request: &AddReplicaRequest) -> Result<AddReplicaResponse> {
        AddReplicaCmd::new(&self.ctx).run(request).await
    }

    /// Stop the overseer and wait for its loop to exit
    pub async fn shutdown(mut self) {
        self.overseer.stop();
        if let Some(handle) = self.overseer_handle.take() {
            let _ = handle.await;
        }
        info!("Local cluster stopped");
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.overseer.stop();
        if let Some(handle) = self.overseer_handle.take() {
            handle.abort();
        }
    }
}
