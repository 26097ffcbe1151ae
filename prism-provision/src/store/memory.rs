//! In-process store backed by an ordered map

use super::{
    paths, CreateMode, DistributedStore, StoreError, StoreEvent, StoreEventKind, StoreResult,
    VersionedData,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: i32,
    ephemeral_session: Option<u64>,
    next_sequence: u64,
}

impl Node {
    fn new(data: Vec<u8>, ephemeral_session: Option<u64>) -> Self {
        Self {
            data,
            version: 0,
            ephemeral_session,
            next_sequence: 0,
        }
    }
}

/// Single-process [`DistributedStore`] used by tests and the CLI simulator.
///
/// Ephemeral nodes belong to the current session; [`MemoryStore::expire_session`]
/// drops them the way a lost coordination session would.
pub struct MemoryStore {
    nodes: RwLock<BTreeMap<String, Node>>,
    session: AtomicU64,
    event_tx: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            session: AtomicU64::new(1),
            event_tx,
        }
    }

    /// Drop every ephemeral node of the current session and start a new one
    pub fn expire_session(&self) {
        let session = self.session.fetch_add(1, Ordering::SeqCst);
        let removed: Vec<String> = {
            let mut nodes = self.nodes.write();
            let expired: Vec<String> = nodes
                .iter()
                .filter(|(_, n)| n.ephemeral_session == Some(session))
                .map(|(p, _)| p.clone())
                .collect();
            for path in &expired {
                nodes.remove(path);
            }
            expired
        };
        debug!(session, removed = removed.len(), "Expired store session");
        for path in removed {
            self.notify(path, StoreEventKind::Deleted);
        }
    }

    /// Number of nodes, excluding the implicit root
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Path and data of every node
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.nodes
            .read()
            .iter()
            .map(|(path, node)| (path.clone(), node.data.clone()))
            .collect()
    }

    /// Paths under `prefix`, the prefix itself included
    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        let nested = format!("{}/", prefix);
        self.nodes
            .read()
            .keys()
            .filter(|p| p.as_str() == prefix || p.starts_with(&nested))
            .cloned()
            .collect()
    }

    fn notify(&self, path: String, kind: StoreEventKind) {
        // No subscribers is fine
        let _ = self.event_tx.send(StoreEvent { path, kind });
    }

    fn parent_exists(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
        match paths::parent(path) {
            Some("/") => true,
            Some(parent) => nodes.contains_key(parent),
            None => false,
        }
    }

    fn has_children(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
        let prefix = format!("{}/", path);
        nodes
            .range(prefix.clone()..)
            .next()
            .map(|(k, _)| k.starts_with(&prefix))
            .unwrap_or(false)
    }

    fn insert(&self, nodes: &mut BTreeMap<String, Node>, path: &str, data: Vec<u8>, mode: CreateMode) -> StoreResult<String> {
        if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') {
            return Err(StoreError::Backend(format!("invalid path: {}", path)));
        }
        if !Self::parent_exists(nodes, path) {
            return Err(StoreError::NoNode(paths::parent(path).unwrap_or(path).to_string()));
        }

        let actual = match mode {
            CreateMode::PersistentSequential => {
                let sequence = match paths::parent(path) {
                    Some(parent) if parent != "/" => match nodes.get_mut(parent) {
                        Some(node) => {
                            let seq = node.next_sequence;
                            node.next_sequence += 1;
                            seq
                        }
                        None => return Err(StoreError::NoNode(parent.to_string())),
                    },
                    _ => return Err(StoreError::Backend("sequential nodes need a parent".into())),
                };
                format!("{}{:010}", path, sequence)
            }
            CreateMode::Persistent | CreateMode::Ephemeral => path.to_string(),
        };

        if nodes.contains_key(&actual) {
            return Err(StoreError::NodeExists(actual));
        }
        let session = match mode {
            CreateMode::Ephemeral => Some(self.session.load(Ordering::SeqCst)),
            _ => None,
        };
        nodes.insert(actual.clone(), Node::new(data, session));
        Ok(actual)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedStore for MemoryStore {
    async fn get(&self, path: &str) -> StoreResult<Option<VersionedData>> {
        Ok(self.nodes.read().get(path).map(|n| VersionedData {
            data: n.data.clone(),
            version: n.version,
        }))
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> StoreResult<String> {
        let actual = {
            let mut nodes = self.nodes.write();
            self.insert(&mut nodes, path, data, mode)?
        };
        self.notify(actual.clone(), StoreEventKind::Created);
        Ok(actual)
    }

    async fn make_path(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> StoreResult<String> {
        let mut created = Vec::new();
        let actual = {
            let mut nodes = self.nodes.write();
            let mut ancestors = Vec::new();
            let mut current = paths::parent(path);
            while let Some(p) = current {
                if p == "/" || nodes.contains_key(p) {
                    break;
                }
                ancestors.push(p.to_string());
                current = paths::parent(p);
            }
            for ancestor in ancestors.into_iter().rev() {
                self.insert(&mut nodes, &ancestor, Vec::new(), CreateMode::Persistent)?;
                created.push(ancestor);
            }
            self.insert(&mut nodes, path, data, mode)?
        };
        for path in created {
            self.notify(path, StoreEventKind::Created);
        }
        self.notify(actual.clone(), StoreEventKind::Created);
        Ok(actual)
    }

    async fn set(&self, path: &str, data: Vec<u8>, expected_version: Option<i32>) -> StoreResult<i32> {
        let version = {
            let mut nodes = self.nodes.write();
            let node = nodes
                .get_mut(path)
                .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
            if let Some(expected) = expected_version {
                if node.version != expected {
                    return Err(StoreError::BadVersion {
                        path: path.to_string(),
                        expected,
                        actual: node.version,
                    });
                }
            }
            node.data = data;
            node.version += 1;
            node.version
        };
        self.notify(path.to_string(), StoreEventKind::DataChanged);
        Ok(version)
    }

    async fn delete(&self, path: &str, expected_version: Option<i32>) -> StoreResult<()> {
        {
            let mut nodes = self.nodes.write();
            let node = nodes
                .get(path)
                .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
            if let Some(expected) = expected_version {
                if node.version != expected {
                    return Err(StoreError::BadVersion {
                        path: path.to_string(),
                        expected,
                        actual: node.version,
                    });
                }
            }
            if Self::has_children(&nodes, path) {
                return Err(StoreError::NotEmpty(path.to_string()));
            }
            nodes.remove(path);
        }
        self.notify(path.to_string(), StoreEventKind::Deleted);
        Ok(())
    }

    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        let nodes = self.nodes.read();
        if path != "/" && !nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        let prefix = if path == "/" { "/".to_string() } else { format!("{}/", path) };
        let children = nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                if rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect();
        Ok(children)
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.event_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_requires_parent() {
        let store = MemoryStore::new();
        let err = store.create("/a/b", vec![], CreateMode::Persistent).await.unwrap_err();
        assert_eq!(err, StoreError::NoNode("/a".to_string()));

        store.create("/a", vec![], CreateMode::Persistent).await.unwrap();
        store.create("/a/b", b"x".to_vec(), CreateMode::Persistent).await.unwrap();
        let err = store.create("/a/b", vec![], CreateMode::Persistent).await.unwrap_err();
        assert!(matches!(err, StoreError::NodeExists(_)));
    }

    #[tokio::test]
    async fn test_conditional_set() {
        let store = MemoryStore::new();
        store.make_path("/c/state.json", b"v0".to_vec(), CreateMode::Persistent).await.unwrap();

        assert_eq!(store.set("/c/state.json", b"v1".to_vec(), Some(0)).await.unwrap(), 1);
        let err = store.set("/c/state.json", b"v2".to_vec(), Some(0)).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::BadVersion {
                path: "/c/state.json".into(),
                expected: 0,
                actual: 1
            }
        );
        let node = store.get("/c/state.json").await.unwrap().unwrap();
        assert_eq!(node.data, b"v1".to_vec());
        assert_eq!(node.version, 1);
    }

    #[tokio::test]
    async fn test_sequential_nodes_are_ordered() {
        let store = MemoryStore::new();
        store.make_path("/q", vec![], CreateMode::Persistent).await.unwrap();
        let first = store.create("/q/qn-", vec![1], CreateMode::PersistentSequential).await.unwrap();
        let second = store.create("/q/qn-", vec![2], CreateMode::PersistentSequential).await.unwrap();
        assert_eq!(first, "/q/qn-0000000000");
        assert_eq!(second, "/q/qn-0000000001");

        // Sequence survives deletion of earlier entries
        store.delete(&first, None).await.unwrap();
        let third = store.create("/q/qn-", vec![3], CreateMode::PersistentSequential).await.unwrap();
        assert_eq!(third, "/q/qn-0000000002");
        assert_eq!(store.children("/q").await.unwrap(), vec!["qn-0000000001", "qn-0000000002"]);
    }

    #[tokio::test]
    async fn test_children_are_direct_only() {
        let store = MemoryStore::new();
        store.make_path("/a/b/c", vec![], CreateMode::Persistent).await.unwrap();
        store.make_path("/a/d", vec![], CreateMode::Persistent).await.unwrap();
        store.make_path("/ab", vec![], CreateMode::Persistent).await.unwrap();

        assert_eq!(store.children("/a").await.unwrap(), vec!["b", "d"]);
        assert_eq!(store.children("/").await.unwrap(), vec!["a", "ab"]);
        assert!(matches!(store.children("/zz").await, Err(StoreError::NoNode(_))));
    }

    #[tokio::test]
    async fn test_delete_non_empty() {
        let store = MemoryStore::new();
        store.make_path("/a/b", vec![], CreateMode::Persistent).await.unwrap();
        assert!(matches!(store.delete("/a", None).await, Err(StoreError::NotEmpty(_))));
        store.delete("/a/b", None).await.unwrap();
        store.delete("/a", None).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_ephemeral_nodes_expire() {
        let store = MemoryStore::new();
        store.make_path("/live_nodes", vec![], CreateMode::Persistent).await.unwrap();
        store.create("/live_nodes/a", vec![], CreateMode::Ephemeral).await.unwrap();
        store.create("/live_nodes/b", vec![], CreateMode::Persistent).await.unwrap();

        store.expire_session();
        assert_eq!(store.children("/live_nodes").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_watch_events() {
        let store = MemoryStore::new();
        let mut events = store.watch();
        store.make_path("/x", vec![], CreateMode::Persistent).await.unwrap();
        store.set("/x", vec![1], None).await.unwrap();
        store.delete("/x", None).await.unwrap();

        assert_eq!(events.recv().await.unwrap().kind, StoreEventKind::Created);
        assert_eq!(events.recv().await.unwrap().kind, StoreEventKind::DataChanged);
        assert_eq!(events.recv().await.unwrap().kind, StoreEventKind::Deleted);
    }
}
