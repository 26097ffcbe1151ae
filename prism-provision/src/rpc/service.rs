//! tarpc service definition for core administration

use super::{AsyncStatus, CoreAdminResponse, CreateCoreRequest, UnloadCoreRequest};
use crate::error::RpcError;

/// Core-admin RPC service served by every node.
#[tarpc::service]
pub trait CoreAdminService {
    /// Create a core for a registered replica
    async fn create_core(request: CreateCoreRequest) -> Result<CoreAdminResponse, RpcError>;

    /// Status of an asynchronous request
    async fn request_status(async_id: String) -> Result<AsyncStatus, RpcError>;

    /// Unload a core, optionally deleting its index
    async fn unload_core(request: UnloadCoreRequest) -> Result<(), RpcError>;

    /// Name this node is registered under
    async fn node_name() -> String;

    /// Simple ping for health checking
    async fn ping() -> String;
}
