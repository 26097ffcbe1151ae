//! Provisioning error types

use crate::placement::PlacementError;
use crate::store::StoreError;
use crate::writer::MutationError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by remote core-admin calls
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("Core already exists: {0}")]
    CoreExists(String),

    #[error("Core not found: {0}")]
    CoreNotFound(String),

    #[error("Core creation failed: {0}")]
    CoreCreation(String),

    #[error("Unknown async request: {0}")]
    UnknownRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RpcError {
    /// Short label used by `RpcTimer::error` and handler metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            RpcError::Connection(_) => "connection",
            RpcError::Transport(_) => "transport",
            RpcError::Timeout(_) => "timeout",
            RpcError::NodeUnavailable(_) => "node_unavailable",
            RpcError::CoreExists(_) => "core_exists",
            RpcError::CoreNotFound(_) => "core_not_found",
            RpcError::CoreCreation(_) => "core_creation",
            RpcError::UnknownRequest(_) => "unknown_request",
            RpcError::Internal(_) => "internal",
        }
    }
}

/// A single failed core-create call, kept with the node it was sent to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node: String,
    pub core: String,
    pub message: String,
}

impl NodeFailure {
    pub fn new(node: impl Into<String>, core: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            core: core.into(),
            message: message.into(),
        }
    }
}

/// Failure taxonomy surfaced to callers of collection commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input or a name collision; nothing was written
    PreconditionViolation,
    /// No config set could be resolved
    ConfigurationNotFound,
    /// Placement is impossible with the current live nodes
    CapacityExceeded,
    /// At least one remote core creation failed; state was rolled back
    ProvisioningFailure,
    /// Anything unexpected
    Server,
}

/// Errors that can occur while running a collection command
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("collection already exists: {0}")]
    CollectionExists(String),

    #[error("collection alias already exists: {0}")]
    AliasExists(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    ConfigNotFound(String),

    #[error(transparent)]
    CapacityExceeded(#[from] PlacementError),

    #[error("Underlying core creation failed while creating collection: {collection}{}", describe_failures(.failures))]
    ProvisioningFailed {
        collection: String,
        failures: Vec<NodeFailure>,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("State mutation failed: {0}")]
    Mutation(#[from] MutationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Server error: {0}")]
    Server(String),
}

fn describe_failures(failures: &[NodeFailure]) -> String {
    if failures.is_empty() {
        return String::new();
    }
    let details: Vec<String> = failures
        .iter()
        .map(|f| format!("{} on {}: {}", f.core, f.node, f.message))
        .collect();
    format!(" ({})", details.join("; "))
}

impl ProvisionError {
    /// Taxonomy kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::CollectionExists(_)
            | ProvisionError::AliasExists(_)
            | ProvisionError::InvalidRequest(_) => ErrorKind::PreconditionViolation,
            ProvisionError::ConfigNotFound(_) => ErrorKind::ConfigurationNotFound,
            ProvisionError::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            ProvisionError::ProvisioningFailed { .. } => ErrorKind::ProvisioningFailure,
            ProvisionError::Store(_)
            | ProvisionError::Mutation(_)
            | ProvisionError::Config(_)
            | ProvisionError::Server(_) => ErrorKind::Server,
        }
    }

    /// Whether the caller is at fault (maps to a 4xx-style response)
    pub fn is_client_error(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Server)
    }

    /// Metrics label for failed commands
    pub fn error_type(&self) -> &'static str {
        match self {
            ProvisionError::CollectionExists(_) => "collection_exists",
            ProvisionError::AliasExists(_) => "alias_exists",
            ProvisionError::InvalidRequest(_) => "invalid_request",
            ProvisionError::ConfigNotFound(_) => "config_not_found",
            ProvisionError::CapacityExceeded(_) => "capacity_exceeded",
            ProvisionError::ProvisioningFailed { .. } => "provisioning_failed",
            ProvisionError::Store(_) => "store",
            ProvisionError::Mutation(_) => "mutation",
            ProvisionError::Config(_) => "config",
            ProvisionError::Server(_) => "server",
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
