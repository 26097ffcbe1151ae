//! Live node registry
//!
//! Each node registers an ephemeral child of `/live_nodes` carrying its
//! [`NodeProperties`] as JSON. The registration disappears with the node's
//! store session.

use crate::store::{ensure_path, paths, CreateMode, DistributedStore, StoreError, StoreResult};
use crate::types::{base_url_for_node, NodeProperties};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// Source of the live-node set
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn live_nodes(&self) -> StoreResult<BTreeSet<String>>;

    async fn node_properties(&self, node: &str) -> StoreResult<Option<NodeProperties>>;

    /// Base URL used to reach `node`
    async fn base_url(&self, node: &str) -> StoreResult<String> {
        let configured = self.node_properties(node).await?.and_then(|p| p.base_url);
        Ok(configured.unwrap_or_else(|| base_url_for_node(node)))
    }
}

/// [`NodeDirectory`] reading `/live_nodes` from the store
pub struct StoreNodeDirectory {
    store: Arc<dyn DistributedStore>,
}

impl StoreNodeDirectory {
    pub fn new(store: Arc<dyn DistributedStore>) -> Self {
        Self { store }
    }

    /// Register `node` as live with the given properties
    pub async fn register(&self, node: &str, properties: &NodeProperties) -> StoreResult<()> {
        ensure_path(self.store.as_ref(), paths::LIVE_NODES).await?;
        let data = serde_json::to_vec(properties)?;
        self.store
            .create(&paths::live_node(node), data, CreateMode::Ephemeral)
            .await?;
        info!(node = %node, zone = ?properties.zone, "Node registered as live");
        Ok(())
    }

    /// Remove the registration of `node`
    pub async fn deregister(&self, node: &str) -> StoreResult<()> {
        match self.store.delete(&paths::live_node(node), None).await {
            Ok(()) | Err(StoreError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl NodeDirectory for StoreNodeDirectory {
    async fn live_nodes(&self) -> StoreResult<BTreeSet<String>> {
        match self.store.children(paths::LIVE_NODES).await {
            Ok(nodes) => Ok(nodes.into_iter().collect()),
            Err(StoreError::NoNode(_)) => Ok(BTreeSet::new()),
            Err(e) => Err(e),
        }
    }

    async fn node_properties(&self, node: &str) -> StoreResult<Option<NodeProperties>> {
        match self.store.get(&paths::live_node(node)).await? {
            Some(data) if data.data.is_empty() => Ok(Some(NodeProperties::default())),
            Some(data) => Ok(Some(serde_json::from_slice(&data.data)?)),
            None => Ok(None),
        }
    }
}
