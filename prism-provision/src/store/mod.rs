//! Hierarchical, versioned key-value store
//!
//! All coordination goes through a [`DistributedStore`]: collection records,
//! live-node registrations, config sets, aliases and the state-update queue.
//! Every node carries a version that is bumped on each write, which is what
//! conditional updates compare against.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

/// Well-known store paths
pub mod paths {
    pub const COLLECTIONS: &str = "/collections";
    pub const LIVE_NODES: &str = "/live_nodes";
    pub const CONFIGS: &str = "/configs";
    pub const ALIASES: &str = "/aliases.json";
    pub const OVERSEER: &str = "/overseer";
    pub const STATE_QUEUE: &str = "/overseer/queue";
    pub const ASYNC_IDS: &str = "/overseer/async_ids";
    pub const PLACEMENT_POLICY: &str = "/placement_policy.json";

    /// Prefix of sequential queue entries
    pub const QUEUE_ENTRY_PREFIX: &str = "qn-";

    pub fn collection(name: &str) -> String {
        format!("{}/{}", COLLECTIONS, name)
    }

    pub fn collection_state(name: &str) -> String {
        format!("{}/{}/state.json", COLLECTIONS, name)
    }

    pub fn replica_states(name: &str) -> String {
        format!("{}/{}/replica_states", COLLECTIONS, name)
    }

    pub fn replica_state(name: &str, replica: &str) -> String {
        format!("{}/{}/replica_states/{}", COLLECTIONS, name, replica)
    }

    pub fn collection_counter(name: &str) -> String {
        format!("{}/{}/counter", COLLECTIONS, name)
    }

    pub fn collection_terms(name: &str) -> String {
        format!("{}/{}/terms", COLLECTIONS, name)
    }

    pub fn live_node(node: &str) -> String {
        format!("{}/{}", LIVE_NODES, node)
    }

    pub fn config_set(name: &str) -> String {
        format!("{}/{}", CONFIGS, name)
    }

    pub fn async_id(id: &str) -> String {
        format!("{}/{}", ASYNC_IDS, id)
    }

    /// Parent of a path, `None` for the root
    pub fn parent(path: &str) -> Option<&str> {
        match path.rfind('/') {
            Some(0) if path.len() > 1 => Some("/"),
            Some(0) | None => None,
            Some(idx) => Some(&path[..idx]),
        }
    }
}

/// Errors from the store layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Version mismatch at {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            StoreError::NoNode(_) => "no_node",
            StoreError::NodeExists(_) => "node_exists",
            StoreError::BadVersion { .. } => "bad_version",
            StoreError::NotEmpty(_) => "not_empty",
            StoreError::Serialization(_) => "serialization",
            StoreError::Backend(_) => "backend",
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Data of a node together with its version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedData {
    pub data: Vec<u8>,
    pub version: i32,
}

/// How a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// A monotonically increasing 10-digit suffix is appended to the path
    PersistentSequential,
    /// Removed when the creating session expires
    Ephemeral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    Created,
    DataChanged,
    Deleted,
}

/// Change notification for a single path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub path: String,
    pub kind: StoreEventKind,
}

/// Versioned hierarchical store shared by all nodes of a cluster
#[async_trait]
pub trait DistributedStore: Send + Sync {
    /// Read a node, `None` if it does not exist
    async fn get(&self, path: &str) -> StoreResult<Option<VersionedData>>;

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        Ok(self.get(path).await?.is_some())
    }

    /// Create a node whose parent must exist. Returns the actual path,
    /// which differs from `path` for sequential nodes.
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> StoreResult<String>;

    /// Create a node and any missing persistent, empty parents
    async fn make_path(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> StoreResult<String>;

    /// Replace the data of a node. With `expected_version`, fails with
    /// `BadVersion` unless the node is still at that version.
    async fn set(&self, path: &str, data: Vec<u8>, expected_version: Option<i32>) -> StoreResult<i32>;

    /// Delete a node without children
    async fn delete(&self, path: &str, expected_version: Option<i32>) -> StoreResult<()>;

    /// Child names of a node, sorted
    async fn children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Delete a node and its whole subtree; missing nodes are not an error
    async fn delete_recursive(&self, path: &str) -> StoreResult<()> {
        let children = match self.children(path).await {
            Ok(children) => children,
            Err(StoreError::NoNode(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        for child in children {
            self.delete_recursive(&format!("{}/{}", path, child)).await?;
        }
        match self.delete(path, None).await {
            Ok(()) | Err(StoreError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Subscribe to change notifications
    fn watch(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Create `path` and its parents unless it already exists
pub async fn ensure_path(store: &dyn DistributedStore, path: &str) -> StoreResult<()> {
    match store.make_path(path, Vec::new(), CreateMode::Persistent).await {
        Ok(_) | Err(StoreError::NodeExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Read and decode a JSON node, returning its version alongside
pub async fn read_json<T: DeserializeOwned>(
    store: &dyn DistributedStore,
    path: &str,
) -> StoreResult<Option<(T, i32)>> {
    match store.get(path).await? {
        Some(node) => {
            let value = serde_json::from_slice(&node.data)?;
            Ok(Some((value, node.version)))
        }
        None => Ok(None),
    }
}

/// Create or overwrite a JSON node
pub async fn write_json<T: Serialize + ?Sized>(
    store: &dyn DistributedStore,
    path: &str,
    value: &T,
) -> StoreResult<()> {
    let data = serde_json::to_vec(value)?;
    match store.make_path(path, data.clone(), CreateMode::Persistent).await {
        Ok(_) => Ok(()),
        Err(StoreError::NodeExists(_)) => store.set(path, data, None).await.map(|_| ()),
        Err(e) => Err(e),
    }
}

/// Create or overwrite a JSON node whose parent must already exist
pub async fn put_json<T: Serialize + ?Sized>(store: &dyn DistributedStore, path: &str, value: &T) -> StoreResult<()> {
    let data = serde_json::to_vec(value)?;
    match store.create(path, data.clone(), CreateMode::Persistent).await {
        Ok(_) => Ok(()),
        Err(StoreError::NodeExists(_)) => store.set(path, data, None).await.map(|_| ()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent() {
        assert_eq!(paths::parent("/collections/foo"), Some("/collections"));
        assert_eq!(paths::parent("/collections"), Some("/"));
        assert_eq!(paths::parent("/"), None);
    }

    #[test]
    fn test_paths() {
        assert_eq!(paths::collection_state("foo"), "/collections/foo/state.json");
        assert_eq!(paths::replica_state("foo", "core_node1"), "/collections/foo/replica_states/core_node1");
        assert_eq!(paths::async_id("1000"), "/overseer/async_ids/1000");
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let store = MemoryStore::new();
        write_json(&store, "/a/b.json", &vec![1, 2, 3]).await.unwrap();
        write_json(&store, "/a/b.json", &vec![4]).await.unwrap();

        let (value, version): (Vec<i32>, i32) = read_json(&store, "/a/b.json").await.unwrap().unwrap();
        assert_eq!(value, vec![4]);
        assert_eq!(version, 1);
        assert!(read_json::<Vec<i32>>(&store, "/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_recursive_default() {
        let store = MemoryStore::new();
        ensure_path(&store, "/x/y/z").await.unwrap();
        ensure_path(&store, "/x/y/z").await.unwrap();
        store.delete_recursive("/x").await.unwrap();
        assert!(!store.exists("/x").await.unwrap());
        store.delete_recursive("/x").await.unwrap();
    }
}
