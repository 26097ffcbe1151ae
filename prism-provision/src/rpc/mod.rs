//! Core-admin RPC
//!
//! Collection commands create and unload cores on remote nodes through the
//! [`CoreAdmin`] trait. Two implementations exist:
//!
//! - [`RpcCoreAdmin`]: tarpc [`CoreAdminServiceClient`]s, one per node, over
//!   TCP or in-process channels
//! - [`LocalCoreAdmin`]: direct calls into in-process [`NodeAgent`]s
//!
//! Both end up in a [`NodeAgent`], which hosts the cores of one node.

mod client;
mod local;
mod server;
mod service;

pub use client::{connect, RpcCoreAdmin};
pub use local::{HostedCore, LocalCoreAdmin, NodeAgent};
pub use server::{CoreAdminHandler, CoreAdminServer};
pub use service::{CoreAdminService, CoreAdminServiceClient};

use crate::error::RpcError;
use crate::types::ReplicaType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Create one core on the receiving node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCoreRequest {
    pub core: String,
    pub collection: String,
    pub shard: String,
    pub replica_type: ReplicaType,
    pub config_name: String,
    pub num_shards: u32,
    /// Name of the replica record the core belongs to
    pub replica_name: Option<String>,
    /// When set, the node acknowledges immediately and reports the outcome
    /// through `request_status`
    pub async_id: Option<String>,
    /// `property.*` pass-through values
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreAdminResponse {
    pub node: String,
    pub core: String,
    pub async_id: Option<String>,
}

/// Progress of an asynchronous core-admin request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsyncStatus {
    Submitted,
    Running,
    Completed,
    Failed(String),
    NotFound,
}

impl AsyncStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AsyncStatus::Completed | AsyncStatus::Failed(_) | AsyncStatus::NotFound)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadCoreRequest {
    pub core: String,
    pub collection: String,
    pub delete_index: bool,
}

/// Core administration on cluster nodes
#[async_trait]
pub trait CoreAdmin: Send + Sync {
    async fn create_core(&self, node: &str, request: CreateCoreRequest) -> Result<CoreAdminResponse, RpcError>;

    async fn request_status(&self, node: &str, async_id: &str) -> Result<AsyncStatus, RpcError>;

    async fn unload_core(&self, node: &str, request: UnloadCoreRequest) -> Result<(), RpcError>;
}
