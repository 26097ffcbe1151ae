//! Core-admin RPC client
//!
//! Holds one tarpc client per node. Clients are added either from a TCP
//! connection ([`connect`]) or from any other transport, such as the
//! in-process channel returned by [`CoreAdminServer::serve_in_process`].
//!
//! [`CoreAdminServer::serve_in_process`]: super::CoreAdminServer::serve_in_process

use super::service::CoreAdminServiceClient;
use super::{AsyncStatus, CoreAdmin, CoreAdminResponse, CreateCoreRequest, UnloadCoreRequest};
use crate::error::RpcError;
use crate::metrics::RpcTimer;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tarpc::client::Config as TarpcConfig;
use tarpc::context;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Open a TCP connection to a node's core-admin server
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<CoreAdminServiceClient, RpcError> {
    debug!("Connecting to core-admin server at {}", addr);
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| RpcError::Timeout(format!("Connection to {} timed out", addr)))?
        .map_err(|e| RpcError::Connection(format!("Failed to connect to {}: {}", addr, e)))?;

    let transport = tarpc::serde_transport::new(
        tokio_util::codec::Framed::new(stream, tarpc::tokio_util::codec::LengthDelimitedCodec::new()),
        tarpc::tokio_serde::formats::Bincode::default(),
    );
    let client = CoreAdminServiceClient::new(TarpcConfig::default(), transport).spawn();

    info!("Connected to core-admin server at {}", addr);
    Ok(client)
}

/// [`CoreAdmin`] over tarpc
pub struct RpcCoreAdmin {
    clients: RwLock<HashMap<String, CoreAdminServiceClient>>,
    request_timeout: Duration,
}

impl RpcCoreAdmin {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            request_timeout,
        }
    }

    /// Route calls for `node` through `client`
    pub fn add_client(&self, node: impl Into<String>, client: CoreAdminServiceClient) {
        self.clients.write().insert(node.into(), client);
    }

    pub fn remove_client(&self, node: &str) -> bool {
        self.clients.write().remove(node).is_some()
    }

    /// Connect to `addr` over TCP and route calls for `node` there
    pub async fn connect_node(&self, node: &str, addr: SocketAddr) -> Result<(), RpcError> {
        let client = connect(addr, self.request_timeout).await?;
        self.add_client(node, client);
        Ok(())
    }

    fn client(&self, node: &str) -> Result<CoreAdminServiceClient, RpcError> {
        self.clients
            .read()
            .get(node)
            .cloned()
            .ok_or_else(|| RpcError::NodeUnavailable(node.to_string()))
    }

    /// Create a context with the configured request timeout
    fn context(&self) -> context::Context {
        let mut ctx = context::current();
        ctx.deadline = std::time::Instant::now() + self.request_timeout;
        ctx
    }

    /// Ping a node
    pub async fn ping(&self, node: &str) -> Result<String, RpcError> {
        let timer = RpcTimer::new("ping", node);
        let client = self.client(node)?;
        match client.ping(self.context()).await {
            Ok(pong) => {
                timer.success();
                Ok(pong)
            }
            Err(e) => {
                let err = transport_error(e);
                timer.error(err.error_type());
                Err(err)
            }
        }
    }
}

fn transport_error(e: tarpc::client::RpcError) -> RpcError {
    match e {
        tarpc::client::RpcError::DeadlineExceeded => RpcError::Timeout("request exceeded its deadline".to_string()),
        other => RpcError::Transport(other.to_string()),
    }
}

/// Fold transport and application errors into one result, recording metrics
fn finish<T>(timer: RpcTimer, result: Result<Result<T, RpcError>, tarpc::client::RpcError>) -> Result<T, RpcError> {
    match result.map_err(transport_error).and_then(|inner| inner) {
        Ok(value) => {
            timer.success();
            Ok(value)
        }
        Err(e) => {
            timer.error(e.error_type());
            Err(e)
        }
    }
}

#[async_trait]
impl CoreAdmin for RpcCoreAdmin {
    async fn create_core(&self, node: &str, request: CreateCoreRequest) -> Result<CoreAdminResponse, RpcError> {
        let timer = RpcTimer::new("create_core", node);
        let client = self.client(node)?;
        finish(timer, client.create_core(self.context(), request).await)
    }

    async fn request_status(&self, node: &str, async_id: &str) -> Result<AsyncStatus, RpcError> {
        let timer = RpcTimer::new("request_status", node);
        let client = self.client(node)?;
        finish(timer, client.request_status(self.context(), async_id.to_string()).await)
    }

    async fn unload_core(&self, node: &str, request: UnloadCoreRequest) -> Result<(), RpcError> {
        let timer = RpcTimer::new("unload_core", node);
        let client = self.client(node)?;
        finish(timer, client.unload_core(self.context(), request).await)
    }
}
