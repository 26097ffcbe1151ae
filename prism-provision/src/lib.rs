//! Prism Provision - Collection creation for Prism cluster mode
//!
//! This crate turns a create-collection request into a registered, fully
//! provisioned collection: shards planned, replicas placed on live nodes,
//! cores created on those nodes and the cluster state published. A failure
//! after the first write rolls everything back.
//!
//! # Architecture
//!
//! - **Commands**: create, delete and add-replica orchestration over a shared context
//! - **Planner**: shard names, hash ranges and replica-count validation
//! - **Placement**: least-loaded and zone-aware replica assignment under session leases
//! - **Writer**: cluster state publication, queued through the overseer or by direct conditional writes
//! - **Tracker**: parallel core creation with async status polling
//! - **RPC**: tarpc core-admin service, client and in-process node agent
//! - **Store**: versioned hierarchical store abstraction with an in-memory backend
//! - **Simulator**: single-process cluster wiring everything together
//!
//! # Key Operations
//!
//! - create_collection: validate, plan, place, publish, provision, roll back on failure
//! - delete_collection: unload cores and remove every stored trace
//! - add_replica: provision one replica of an existing collection
//! - Overseer: apply queued state mutations in order

pub mod commands;
pub mod config;
pub mod configset;
pub mod error;
pub mod metrics;
pub mod nodes;
pub mod placement;
pub mod planner;
pub mod request;
pub mod rpc;
pub mod simulator;
pub mod state;
pub mod store;
pub mod tracker;
pub mod types;
pub mod wait;
pub mod writer;

pub use commands::{
    AddReplicaCmd, AddReplicaRequest, AddReplicaResponse, CommandContext, CreateCollectionCmd,
    DeleteCollectionCmd,
};
pub use config::ProvisionConfig;
pub use error::{ErrorKind, NodeFailure, ProvisionError, RpcError};
pub use placement::{AssignStrategy, PlacementError, PlacementPolicy, PlacementSessions, SpreadLevel};
pub use request::{CoreAck, CreateCollectionRequest, CreateCollectionResponse};
pub use simulator::LocalCluster;
pub use state::{ClusterState, ClusterStateReader, ClusterStateView};
pub use store::{DistributedStore, MemoryStore, StoreError};
pub use tracker::{fetch_async_outcome, AsyncOutcome};
pub use types::*;
pub use writer::{ClusterStateWriter, Overseer, StateProtocol};
