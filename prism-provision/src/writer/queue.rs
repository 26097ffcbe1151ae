//! Ordered state-update queue under `/overseer/queue`
//!
//! Entries are persistent sequential nodes holding a bincode-encoded
//! [`StateMutation`]; sequence numbers give the consumption order.

use super::StateMutation;
use crate::store::{ensure_path, paths, CreateMode, DistributedStore, StoreError, StoreResult};
use std::sync::Arc;
use tracing::trace;

/// A queued message as read from the store
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub path: String,
    payload: Vec<u8>,
}

impl QueueEntry {
    pub fn decode(&self) -> StoreResult<StateMutation> {
        Ok(bincode::deserialize(&self.payload)?)
    }
}

#[derive(Clone)]
pub struct StateUpdateQueue {
    store: Arc<dyn DistributedStore>,
}

impl StateUpdateQueue {
    pub fn new(store: Arc<dyn DistributedStore>) -> Self {
        Self { store }
    }

    /// Append a mutation; returns the entry path
    pub async fn offer(&self, mutation: &StateMutation) -> StoreResult<String> {
        let payload = bincode::serialize(mutation)?;
        ensure_path(self.store.as_ref(), paths::STATE_QUEUE).await?;
        let path = self
            .store
            .create(
                &format!("{}/{}", paths::STATE_QUEUE, paths::QUEUE_ENTRY_PREFIX),
                payload,
                CreateMode::PersistentSequential,
            )
            .await?;
        trace!(entry = %path, kind = mutation.kind(), collection = %mutation.collection(), "Queued state mutation");
        Ok(path)
    }

    /// Up to `max` entries in queue order
    pub async fn peek(&self, max: usize) -> StoreResult<Vec<QueueEntry>> {
        let children = match self.store.children(paths::STATE_QUEUE).await {
            Ok(children) => children,
            Err(StoreError::NoNode(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut entries = Vec::new();
        for child in children
            .into_iter()
            .filter(|c| c.starts_with(paths::QUEUE_ENTRY_PREFIX))
            .take(max)
        {
            let path = format!("{}/{}", paths::STATE_QUEUE, child);
            if let Some(node) = self.store.get(&path).await? {
                entries.push(QueueEntry {
                    path,
                    payload: node.data,
                });
            }
        }
        Ok(entries)
    }

    pub async fn remove(&self, entry: &QueueEntry) -> StoreResult<()> {
        match self.store.delete(&entry.path, None).await {
            Ok(()) | Err(StoreError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn len(&self) -> StoreResult<usize> {
        match self.store.children(paths::STATE_QUEUE).await {
            Ok(children) => Ok(children.len()),
            Err(StoreError::NoNode(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub async fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::ReplicaState;

    fn set_state(core: &str) -> StateMutation {
        StateMutation::SetReplicaState {
            collection: "foo".into(),
            core: core.into(),
            state: ReplicaState::Active,
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = StateUpdateQueue::new(Arc::new(MemoryStore::new()));
        assert!(queue.is_empty().await.unwrap());

        for core in ["c1", "c2", "c3"] {
            queue.offer(&set_state(core)).await.unwrap();
        }
        assert_eq!(queue.len().await.unwrap(), 3);

        let entries = queue.peek(10).await.unwrap();
        let decoded: Vec<StateMutation> = entries.iter().map(|e| e.decode().unwrap()).collect();
        assert_eq!(decoded, vec![set_state("c1"), set_state("c2"), set_state("c3")]);

        queue.remove(&entries[0]).await.unwrap();
        let rest = queue.peek(1).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].decode().unwrap(), set_state("c2"));
    }

    #[tokio::test]
    async fn test_undecodable_entry() {
        let store = Arc::new(MemoryStore::new());
        let queue = StateUpdateQueue::new(store.clone());
        ensure_path(store.as_ref(), paths::STATE_QUEUE).await.unwrap();
        store
            .create("/overseer/queue/qn-", vec![0xff, 0xff], CreateMode::PersistentSequential)
            .await
            .unwrap();

        let entries = queue.peek(10).await.unwrap();
        assert!(matches!(entries[0].decode(), Err(StoreError::Serialization(_))));
    }
}
