//! Cluster state snapshots
//!
//! [`ClusterState`] is an immutable snapshot of collections, live nodes,
//! aliases and the placement policy. [`ClusterStateReader`] rebuilds it from
//! the store on [`ClusterStateReader::refresh`] and hands out `Arc`s, so a
//! command always reasons about one consistent view and asks for a new one
//! explicitly when it needs fresher data.

mod aliases;
mod overlay;

pub use aliases::{AliasManager, Aliases};
pub use overlay::OverlayClusterState;

use crate::nodes::NodeDirectory;
use crate::placement::PlacementPolicy;
use crate::store::{paths, read_json, DistributedStore, StoreError, StoreResult};
use crate::types::{Collection, NodeProperties, ReplicaState};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Read access to collections and live nodes
pub trait ClusterStateView: Send + Sync {
    fn collection(&self, name: &str) -> Option<&Collection>;

    fn collection_names(&self) -> Vec<String>;

    fn live_nodes(&self) -> &BTreeSet<String>;

    fn node_properties(&self, node: &str) -> Option<&NodeProperties>;

    fn has_collection(&self, name: &str) -> bool {
        self.collection(name).is_some()
    }

    /// Cores of all collections hosted on `node`
    fn cores_on_node(&self, node: &str) -> usize {
        self.collection_names()
            .iter()
            .filter_map(|name| self.collection(name))
            .map(|c| c.replicas_on_node(node).count())
            .sum()
    }
}

/// Immutable snapshot of the cluster
#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    collections: BTreeMap<String, Collection>,
    versions: BTreeMap<String, i32>,
    live_nodes: BTreeSet<String>,
    node_properties: HashMap<String, NodeProperties>,
    aliases: Aliases,
    placement_policy: Option<PlacementPolicy>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_live_node(mut self, node: impl Into<String>, properties: NodeProperties) -> Self {
        let node = node.into();
        self.node_properties.insert(node.clone(), properties);
        self.live_nodes.insert(node);
        self
    }

    pub fn with_collection(mut self, collection: Collection) -> Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    pub fn with_aliases(mut self, aliases: Aliases) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn with_placement_policy(mut self, policy: PlacementPolicy) -> Self {
        self.placement_policy = Some(policy);
        self
    }

    pub fn collections(&self) -> impl Iterator<Item = &Collection> {
        self.collections.values()
    }

    /// Store version of the collection record this snapshot was built from
    pub fn collection_version(&self, name: &str) -> Option<i32> {
        self.versions.get(name).copied()
    }

    pub fn aliases(&self) -> &Aliases {
        &self.aliases
    }

    pub fn placement_policy(&self) -> Option<&PlacementPolicy> {
        self.placement_policy.as_ref()
    }
}

impl ClusterStateView for ClusterState {
    fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name)
    }

    fn collection_names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    fn live_nodes(&self) -> &BTreeSet<String> {
        &self.live_nodes
    }

    fn node_properties(&self, node: &str) -> Option<&NodeProperties> {
        self.node_properties.get(node)
    }
}

/// Builds [`ClusterState`] snapshots from the store
pub struct ClusterStateReader {
    store: Arc<dyn DistributedStore>,
    nodes: Arc<dyn NodeDirectory>,
    current: RwLock<Arc<ClusterState>>,
}

impl ClusterStateReader {
    pub fn new(store: Arc<dyn DistributedStore>, nodes: Arc<dyn NodeDirectory>) -> Self {
        Self {
            store,
            nodes,
            current: RwLock::new(Arc::new(ClusterState::default())),
        }
    }

    /// Last snapshot built by [`refresh`](Self::refresh)
    pub fn current(&self) -> Arc<ClusterState> {
        self.current.read().clone()
    }

    /// Re-read everything from the store and publish a new snapshot
    pub async fn refresh(&self) -> StoreResult<Arc<ClusterState>> {
        let mut state = ClusterState::default();

        let names = match self.store.children(paths::COLLECTIONS).await {
            Ok(names) => names,
            Err(StoreError::NoNode(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        for name in names {
            // A metadata node without state.json is a collection still being created
            let Some((mut collection, version)) = load_collection(self.store.as_ref(), &name).await? else {
                continue;
            };
            if collection.per_replica_state {
                apply_replica_states(self.store.as_ref(), &mut collection).await?;
            }
            state.versions.insert(name.clone(), version);
            state.collections.insert(name, collection);
        }

        for node in self.nodes.live_nodes().await? {
            let properties = self.nodes.node_properties(&node).await?.unwrap_or_default();
            state.node_properties.insert(node.clone(), properties);
            state.live_nodes.insert(node);
        }

        state.aliases = Aliases::load(self.store.as_ref()).await?.0;
        state.placement_policy = match read_json::<PlacementPolicy>(self.store.as_ref(), paths::PLACEMENT_POLICY).await {
            Ok(policy) => policy.map(|(p, _)| p),
            Err(StoreError::Serialization(e)) => {
                warn!(error = %e, "Ignoring unreadable placement policy");
                None
            }
            Err(e) => return Err(e),
        };

        debug!(
            collections = state.collections.len(),
            live_nodes = state.live_nodes.len(),
            "Refreshed cluster state"
        );

        let state = Arc::new(state);
        *self.current.write() = state.clone();
        Ok(state)
    }
}

/// Serialize a collection as `{ "<name>": { ... } }`
pub fn encode_collection(collection: &Collection) -> StoreResult<Vec<u8>> {
    let mut record = BTreeMap::new();
    record.insert(collection.name.as_str(), collection);
    Ok(serde_json::to_vec(&record)?)
}

pub fn decode_collection(name: &str, data: &[u8]) -> StoreResult<Collection> {
    let mut record: BTreeMap<String, Collection> = serde_json::from_slice(data)?;
    record
        .remove(name)
        .ok_or_else(|| StoreError::Serialization(format!("state record does not contain collection {}", name)))
}

/// Read a collection record and its version
pub async fn load_collection(store: &dyn DistributedStore, name: &str) -> StoreResult<Option<(Collection, i32)>> {
    match store.get(&paths::collection_state(name)).await? {
        Some(node) => Ok(Some((decode_collection(name, &node.data)?, node.version))),
        None => Ok(None),
    }
}

/// Per-replica state records of a collection keyed by replica name
pub async fn load_replica_states(
    store: &dyn DistributedStore,
    collection: &str,
) -> StoreResult<BTreeMap<String, ReplicaState>> {
    let dir = paths::replica_states(collection);
    let replicas = match store.children(&dir).await {
        Ok(replicas) => replicas,
        Err(StoreError::NoNode(_)) => return Ok(BTreeMap::new()),
        Err(e) => return Err(e),
    };
    let mut states = BTreeMap::new();
    for replica in replicas {
        if let Some((state, _)) = read_json::<ReplicaState>(store, &format!("{}/{}", dir, replica)).await? {
            states.insert(replica, state);
        }
    }
    Ok(states)
}

/// Overwrite replica states in `collection` with its per-replica records
pub async fn apply_replica_states(store: &dyn DistributedStore, collection: &mut Collection) -> StoreResult<()> {
    let states = load_replica_states(store, &collection.name).await?;
    for shard in &mut collection.shards {
        for replica in shard.replicas.values_mut() {
            if let Some(state) = states.get(&replica.name) {
                replica.state = *state;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::StoreNodeDirectory;
    use crate::store::{write_json, CreateMode, MemoryStore};
    use crate::types::{Replica, ReplicaType, Router, Shard};

    fn sample_collection(name: &str, per_replica_state: bool) -> Collection {
        let mut shard = Shard::new("shard1", None);
        shard.replicas.insert(
            "core_node1".into(),
            Replica {
                name: "core_node1".into(),
                core: format!("{}_shard1_replica_n1", name),
                shard: "shard1".into(),
                node_name: "node-a".into(),
                base_url: "http://node-a".into(),
                replica_type: ReplicaType::Nrt,
                state: ReplicaState::Down,
            },
        );
        Collection {
            name: name.to_string(),
            router: Router::Implicit,
            shards: vec![shard],
            config_name: "conf".into(),
            per_replica_state,
            max_shards_per_node: 1,
            nrt_replicas: 1,
            tlog_replicas: 0,
            pull_replicas: 0,
            colocated_with: None,
            with_collection: None,
            properties: BTreeMap::new(),
        }
    }

    #[test]
    fn test_encode_decode() {
        let collection = sample_collection("foo", false);
        let data = encode_collection(&collection).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert!(json.get("foo").is_some());
        assert_eq!(decode_collection("foo", &data).unwrap(), collection);
        assert!(decode_collection("bar", &data).is_err());
    }

    #[test]
    fn test_cores_on_node() {
        let state = ClusterState::new()
            .with_live_node("node-a", NodeProperties::default())
            .with_collection(sample_collection("foo", false))
            .with_collection(sample_collection("bar", false));
        assert_eq!(state.cores_on_node("node-a"), 2);
        assert_eq!(state.cores_on_node("node-b"), 0);
        assert!(state.has_collection("foo"));
    }

    #[tokio::test]
    async fn test_refresh_reads_store() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let nodes = Arc::new(StoreNodeDirectory::new(store.clone()));
        nodes.register("node-a", &NodeProperties::with_zone("z1")).await.unwrap();

        let collection = sample_collection("foo", true);
        store
            .make_path(
                &paths::collection_state("foo"),
                encode_collection(&collection).unwrap(),
                CreateMode::Persistent,
            )
            .await
            .unwrap();
        write_json(store.as_ref(), &paths::replica_state("foo", "core_node1"), &ReplicaState::Active)
            .await
            .unwrap();
        // Metadata node only, no state yet
        store.make_path("/collections/pending", vec![], CreateMode::Persistent).await.unwrap();

        let reader = ClusterStateReader::new(store.clone(), nodes);
        assert!(reader.current().collection("foo").is_none());

        let state = reader.refresh().await.unwrap();
        let foo = state.collection("foo").unwrap();
        assert!(foo.all_replicas_active());
        assert!(state.collection("pending").is_none());
        assert_eq!(state.collection_version("foo"), Some(0));
        assert!(state.live_nodes().contains("node-a"));
        assert_eq!(state.node_properties("node-a").unwrap().zone.as_deref(), Some("z1"));
        assert!(reader.current().has_collection("foo"));
    }
}
