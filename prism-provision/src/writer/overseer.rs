//! Single consumer of the state-update queue
//!
//! The overseer drains `/overseer/queue` in sequence order and applies each
//! mutation to the collection record with a conditional write. Mutations
//! that can never apply are logged and dropped; store failures leave the
//! entry in place for the next pass.

use super::mutator::{self, MutationError, StateMutation};
use super::queue::StateUpdateQueue;
use crate::error::{ProvisionError, Result};
use crate::metrics;
use crate::state::{encode_collection, load_collection};
use crate::store::{paths, CreateMode, DistributedStore, StoreError, StoreResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Entries handled per pass
const BATCH_SIZE: usize = 64;

pub struct Overseer {
    store: Arc<dyn DistributedStore>,
    queue: StateUpdateQueue,
    poll_interval: Duration,
    running: AtomicBool,
}

impl Overseer {
    pub fn new(store: Arc<dyn DistributedStore>, poll_interval: Duration) -> Self {
        Self {
            queue: StateUpdateQueue::new(store.clone()),
            store,
            poll_interval,
            running: AtomicBool::new(false),
        }
    }

    /// Drain everything currently queued; returns how many entries were consumed
    pub async fn process_pending(&self) -> StoreResult<usize> {
        let mut consumed = 0;
        loop {
            let entries = self.queue.peek(BATCH_SIZE).await?;
            if entries.is_empty() {
                break;
            }
            let batch = entries.len();
            for entry in entries {
                let mutation = match entry.decode() {
                    Ok(mutation) => mutation,
                    Err(e) => {
                        warn!(entry = %entry.path, error = %e, "Dropping undecodable state mutation");
                        self.queue.remove(&entry).await?;
                        metrics::record_state_mutation("unknown", "undecodable");
                        consumed += 1;
                        continue;
                    }
                };

                match self.apply(&mutation).await {
                    Ok(()) => {
                        metrics::record_state_mutation(mutation.kind(), "applied");
                    }
                    Err(ProvisionError::Mutation(e)) => {
                        warn!(
                            kind = mutation.kind(),
                            collection = %mutation.collection(),
                            error = %e,
                            "Rejected state mutation"
                        );
                        metrics::record_state_mutation(mutation.kind(), "rejected");
                    }
                    Err(e) => {
                        warn!(
                            kind = mutation.kind(),
                            collection = %mutation.collection(),
                            error = %e,
                            "State mutation failed, will retry"
                        );
                        metrics::record_state_mutation(mutation.kind(), "retry");
                        return Ok(consumed);
                    }
                }
                self.queue.remove(&entry).await?;
                consumed += 1;
            }
            if batch < BATCH_SIZE {
                break;
            }
        }
        if consumed > 0 {
            metrics::update_queue_depth(self.queue.len().await?);
        }
        Ok(consumed)
    }

    /// Apply one mutation to the store
    pub async fn apply(&self, mutation: &StateMutation) -> Result<()> {
        debug!(kind = mutation.kind(), collection = %mutation.collection(), "Applying state mutation");
        match mutation {
            StateMutation::CreateCollection(collection) => {
                let path = paths::collection_state(&collection.name);
                match self
                    .store
                    .make_path(&path, encode_collection(collection)?, CreateMode::Persistent)
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(StoreError::NodeExists(_)) => {
                        Err(MutationError::CollectionExists(collection.name.clone()).into())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            StateMutation::AddReplica(op) => self.update(&op.collection, |c| mutator::add_replica(c, op)).await,
            StateMutation::SetReplicaState { collection, core, state } => {
                self.update(collection, |c| mutator::set_replica_state(c, core, *state))
                    .await
            }
            StateMutation::ModifyCollection {
                collection,
                modification,
            } => {
                self.update(collection, |c| Ok(mutator::modify_collection(c, modification)))
                    .await
            }
            // The whole subtree goes, including a metadata node recreated by a
            // CreateCollection that was still queued when the delete was issued
            StateMutation::DeleteCollection { collection } => {
                self.store.delete_recursive(&paths::collection(collection)).await?;
                Ok(())
            }
        }
    }

    async fn update<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&crate::types::Collection) -> std::result::Result<crate::types::Collection, MutationError>,
    {
        let (current, version) = load_collection(self.store.as_ref(), name)
            .await?
            .ok_or_else(|| MutationError::CollectionNotFound(name.to_string()))?;
        let next = f(&current)?;
        self.store
            .set(&paths::collection_state(name), encode_collection(&next)?, Some(version))
            .await?;
        Ok(())
    }

    /// Start the consumer loop
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);

        let overseer = Arc::clone(&self);
        tokio::spawn(async move {
            overseer.run_loop().await;
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn run_loop(&self) {
        let mut events = self.store.watch();
        let mut ticker = tokio::time::interval(self.poll_interval);
        info!(interval_ms = self.poll_interval.as_millis() as u64, "Overseer started");

        while self.is_running() {
            if let Err(e) = self.process_pending().await {
                warn!(error = %e, "Failed to process state-update queue");
            }

            tokio::select! {
                _ = ticker.tick() => {}
                event = events.recv() => match event {
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Overseer lagged behind store events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Store event stream closed, stopping overseer");
                        break;
                    }
                },
            }
        }

        info!("Overseer stopped");
    }
}
