//! Core-admin RPC server
//!
//! Serves a [`NodeAgent`] over tarpc, either on a TCP listener or on an
//! in-process channel.

use super::service::{CoreAdminService, CoreAdminServiceClient};
use super::{AsyncStatus, CoreAdminResponse, CreateCoreRequest, NodeAgent, UnloadCoreRequest};
use crate::error::RpcError;
use crate::metrics::RpcHandlerTimer;
use futures::StreamExt;
use std::sync::Arc;
use tarpc::context::Context;
use tarpc::server::{BaseChannel, Channel};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Core-admin server for one node
pub struct CoreAdminServer {
    agent: Arc<NodeAgent>,
}

impl CoreAdminServer {
    pub fn new(agent: Arc<NodeAgent>) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> Arc<NodeAgent> {
        Arc::clone(&self.agent)
    }

    /// Accept connections until the listener fails
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        info!(
            node = %self.agent.node(),
            addr = ?listener.local_addr().ok(),
            "Core-admin server started"
        );

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("Accepted connection from {}", peer);
            let handler = CoreAdminHandler {
                agent: Arc::clone(&self.agent),
            };
            tokio::spawn(async move {
                Self::handle_connection(handler, stream).await;
                debug!("Connection from {} closed", peer);
            });
        }
    }

    async fn handle_connection(handler: CoreAdminHandler, stream: TcpStream) {
        let transport = tarpc::serde_transport::new(
            tokio_util::codec::Framed::new(stream, tarpc::tokio_util::codec::LengthDelimitedCodec::new()),
            tarpc::tokio_serde::formats::Bincode::default(),
        );

        BaseChannel::with_defaults(transport)
            .execute(handler.serve())
            .for_each(|response| async move {
                tokio::spawn(response);
            })
            .await;
    }

    /// Serve over an in-process channel and return a client for it
    pub fn serve_in_process(&self) -> CoreAdminServiceClient {
        let (client_transport, server_transport) = tarpc::transport::channel::unbounded();
        let handler = CoreAdminHandler {
            agent: Arc::clone(&self.agent),
        };

        tokio::spawn(
            BaseChannel::with_defaults(server_transport)
                .execute(handler.serve())
                .for_each(|response| async move {
                    tokio::spawn(response);
                }),
        );

        CoreAdminServiceClient::new(tarpc::client::Config::default(), client_transport).spawn()
    }
}

/// Handler that implements the CoreAdminService
#[derive(Clone)]
pub struct CoreAdminHandler {
    agent: Arc<NodeAgent>,
}

impl CoreAdminService for CoreAdminHandler {
    async fn create_core(self, _ctx: Context, request: CreateCoreRequest) -> Result<CoreAdminResponse, RpcError> {
        let timer = RpcHandlerTimer::new("create_core");
        match self.agent.create_core(request).await {
            Ok(response) => {
                timer.success();
                Ok(response)
            }
            Err(e) => {
                warn!(node = %self.agent.node(), error = %e, "create_core failed");
                timer.error(e.error_type());
                Err(e)
            }
        }
    }

    async fn request_status(self, _ctx: Context, async_id: String) -> Result<AsyncStatus, RpcError> {
        let timer = RpcHandlerTimer::new("request_status");
        let status = self.agent.request_status(&async_id);
        timer.success();
        Ok(status)
    }

    async fn unload_core(self, _ctx: Context, request: UnloadCoreRequest) -> Result<(), RpcError> {
        let timer = RpcHandlerTimer::new("unload_core");
        match self.agent.unload_core(&request) {
            Ok(()) => {
                timer.success();
                Ok(())
            }
            Err(e) => {
                timer.error(e.error_type());
                Err(e)
            }
        }
    }

    async fn node_name(self, _ctx: Context) -> String {
        self.agent.node().to_string()
    }

    async fn ping(self, _ctx: Context) -> String {
        let timer = RpcHandlerTimer::new("ping");
        timer.success();
        "pong".to_string()
    }
}
