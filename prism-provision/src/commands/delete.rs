//! Delete a collection
//!
//! Also the rollback path of a failed creation, so it has to cope with any
//! partial state: a metadata node without a record, a record still sitting
//! in the state-update queue, or cores on nodes that have gone away.

use super::CommandContext;
use crate::error::Result;
use crate::metrics;
use crate::rpc::UnloadCoreRequest;
use crate::state::ClusterStateView;
use crate::store::paths;
use crate::writer::StateProtocol;
use futures::future::join_all;
use std::time::Instant;
use tracing::{info, warn};

pub struct DeleteCollectionCmd<'a> {
    ctx: &'a CommandContext,
}

impl<'a> DeleteCollectionCmd<'a> {
    pub fn new(ctx: &'a CommandContext) -> Self {
        Self { ctx }
    }

    /// Remove `name` and everything stored for it; a missing collection is not an error
    pub async fn run(&self, name: &str) -> Result<()> {
        let start = Instant::now();
        let result = self.delete(name).await;
        if let Err(e) = &result {
            metrics::record_command_failed("delete_collection", e.error_type());
        }
        info!(
            collection = %name,
            ok = result.is_ok(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Delete collection finished"
        );
        result
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let state = self.ctx.reader.refresh().await?;

        match state.collection(name) {
            Some(collection) => {
                let protocol = StateProtocol::of(collection);
                let unloads = collection.replicas().map(|replica| async move {
                    let request = UnloadCoreRequest {
                        core: replica.core.clone(),
                        collection: name.to_string(),
                        delete_index: true,
                    };
                    if let Err(e) = self.ctx.core_admin.unload_core(&replica.node_name, request).await {
                        warn!(
                            collection = %name,
                            core = %replica.core,
                            node = %replica.node_name,
                            error = %e,
                            "Could not unload core"
                        );
                    }
                });
                join_all(unloads).await;

                self.ctx.writer.delete_collection(protocol, name).await?;
                if protocol == StateProtocol::Queued {
                    let gone = self
                        .ctx
                        .wait_for_state(self.ctx.config.visibility_poll(), |s| !s.has_collection(name))
                        .await?;
                    if gone.is_none() {
                        warn!(collection = %name, "Collection still visible after delete, removing its nodes directly");
                    }
                }
            }
            None => {
                // A queued creation may not have been applied yet; queue a
                // delete behind it so the overseer cannot resurrect the record
                self.ctx
                    .writer
                    .delete_collection(StateProtocol::Queued, name)
                    .await?;
                self.ctx
                    .writer
                    .delete_collection(StateProtocol::Direct, name)
                    .await?;
            }
        }

        self.ctx.store.delete_recursive(&paths::collection(name)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvisionConfig;
    use crate::rpc::LocalCoreAdmin;
    use crate::store::{CreateMode, DistributedStore, MemoryStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_delete_missing_collection_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let ctx = CommandContext::new(store.clone(), Arc::new(LocalCoreAdmin::new()), ProvisionConfig::default());
        DeleteCollectionCmd::new(&ctx).run("nope").await.unwrap();
        DeleteCollectionCmd::new(&ctx).run("nope").await.unwrap();
        assert!(!store.exists("/collections/nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_removes_metadata_only_collection() {
        let store = Arc::new(MemoryStore::new());
        store
            .make_path("/collections/half/counter", b"3".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        let ctx = CommandContext::new(store.clone(), Arc::new(LocalCoreAdmin::new()), ProvisionConfig::default());
        DeleteCollectionCmd::new(&ctx).run("half").await.unwrap();
        assert!(!store.exists("/collections/half").await.unwrap());
    }
}
