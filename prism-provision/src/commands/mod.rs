//! Collection commands
//!
//! - [`CreateCollectionCmd`]: plan, place, publish and provision a new collection
//! - [`DeleteCollectionCmd`]: unload cores and remove every trace of a collection
//! - [`AddReplicaCmd`]: provision one more replica of an existing collection
//!
//! Commands share a [`CommandContext`] holding the store, the cluster state
//! reader and writer, and the collaborators they call out to.

mod add_replica;
mod create;
mod delete;

pub use add_replica::{AddReplicaCmd, AddReplicaRequest, AddReplicaResponse};
pub use create::{create_collection_metadata, CreateCollectionCmd};
pub use delete::DeleteCollectionCmd;

use crate::config::ProvisionConfig;
use crate::configset::{ConfigSetService, StoreConfigSets};
use crate::error::Result;
use crate::nodes::{NodeDirectory, StoreNodeDirectory};
use crate::placement::PlacementSessions;
use crate::rpc::CoreAdmin;
use crate::state::{AliasManager, ClusterState, ClusterStateReader};
use crate::store::{paths, read_json, CreateMode, DistributedStore, StoreError};
use crate::types::ReplicaType;
use crate::wait::{poll_until, PollConfig};
use crate::writer::ClusterStateWriter;
use std::sync::Arc;
use tracing::trace;

/// Everything a collection command needs
#[derive(Clone)]
pub struct CommandContext {
    pub store: Arc<dyn DistributedStore>,
    pub reader: Arc<ClusterStateReader>,
    pub writer: ClusterStateWriter,
    pub nodes: Arc<dyn NodeDirectory>,
    pub configsets: Arc<dyn ConfigSetService>,
    pub core_admin: Arc<dyn CoreAdmin>,
    pub sessions: Arc<PlacementSessions>,
    pub config: ProvisionConfig,
}

impl CommandContext {
    /// Context with store-backed node directory and config sets
    pub fn new(store: Arc<dyn DistributedStore>, core_admin: Arc<dyn CoreAdmin>, config: ProvisionConfig) -> Self {
        let nodes: Arc<dyn NodeDirectory> = Arc::new(StoreNodeDirectory::new(store.clone()));
        Self {
            reader: Arc::new(ClusterStateReader::new(store.clone(), nodes.clone())),
            writer: ClusterStateWriter::new(store.clone(), config.max_cas_retries),
            configsets: Arc::new(StoreConfigSets::new(store.clone())),
            sessions: Arc::new(PlacementSessions::new()),
            nodes,
            store,
            core_admin,
            config,
        }
    }

    pub fn aliases(&self) -> AliasManager {
        AliasManager::new(self.store.clone(), self.config.max_cas_retries)
    }

    /// Refresh the cluster state until `ready` holds; returns the first
    /// snapshot that satisfied it, `None` on timeout
    pub async fn wait_for_state<F>(&self, poll: PollConfig, ready: F) -> Result<Option<Arc<ClusterState>>>
    where
        F: Fn(&ClusterState) -> bool + Sync,
    {
        let reader = &self.reader;
        let ready = &ready;
        let state = poll_until(poll, move || async move {
            let state = reader.refresh().await?;
            Ok::<_, StoreError>(ready(&state).then_some(state))
        })
        .await?;
        Ok(state)
    }
}

/// Next core name of a collection, `<collection>_<shard>_replica_<t><N>`.
///
/// `N` comes from the counter node under the collection's metadata node and
/// never repeats for the lifetime of the collection.
pub async fn allocate_core_name(
    store: &dyn DistributedStore,
    collection: &str,
    shard: &str,
    replica_type: ReplicaType,
    max_retries: usize,
) -> Result<String> {
    let path = paths::collection_counter(collection);
    for _ in 0..max_retries.max(1) {
        let written = match read_json::<u64>(store, &path).await? {
            Some((current, version)) => store
                .set(&path, serde_json::to_vec(&(current + 1)).map_err(StoreError::from)?, Some(version))
                .await
                .map(|_| current + 1),
            None => store
                .make_path(&path, serde_json::to_vec(&1u64).map_err(StoreError::from)?, CreateMode::Persistent)
                .await
                .map(|_| 1),
        };
        match written {
            Ok(n) => {
                let name = format!("{}_{}_replica_{}{}", collection, shard, replica_type.suffix_char(), n);
                trace!(core = %name, "Allocated core name");
                return Ok(name);
            }
            Err(StoreError::BadVersion { .. }) | Err(StoreError::NodeExists(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(StoreError::Backend(format!("could not allocate a core name for {} after {} attempts", collection, max_retries)).into())
}
