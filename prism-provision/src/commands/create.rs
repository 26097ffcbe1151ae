//! Create a collection
//!
//! The command runs as one straight line of steps. Validation happens before
//! anything is written. Once the metadata node exists, every failure goes
//! through [`CreateCollectionCmd::rollback`], which deletes whatever the run
//! created, and the caller gets exactly one error.
//!
//! # Steps
//!
//! 1. Plan shard names
//! 2. Create `/collections/<name>` with the config name and `collection.*` properties
//! 3. Publish the empty collection record (queued: wait until visible)
//! 4. Place replicas under a placement lease
//! 5. Stop here with an empty topology when no node is live
//! 6. Put a companion replica on every chosen node lacking one
//! 7. Register every replica before any core exists
//! 8. Create all cores in parallel
//! 9. Wait for every replica to report ACTIVE (direct protocol, or on request)
//! 10. Link the companion collection back to the new one
//! 11. Add the alias

use super::{allocate_core_name, AddReplicaCmd, AddReplicaRequest, CommandContext, DeleteCollectionCmd};
use crate::configset::{autocreated_name, resolve_config_name, DEFAULT_CONFIGSET, DEFAULT_CONFIGSET_WARNING};
use crate::error::{NodeFailure, ProvisionError, Result};
use crate::metrics;
use crate::placement::{AssignRequest, AssignStrategy, ReplicaPosition, SessionLease};
use crate::planner::{build_shards, check_max_shards_per_node, check_replica_types, plan_shards, ReplicaCounts};
use crate::request::{CoreAck, CreateCollectionRequest, CreateCollectionResponse};
use crate::rpc::CreateCoreRequest;
use crate::state::{ClusterStateView, OverlayClusterState};
use crate::store::{paths, read_json, write_json, CreateMode, DistributedStore, StoreError};
use crate::tracker::{record_outcome, AsyncOutcome, ShardRequest, ShardRequestTracker};
use crate::types::{Collection, Replica, ReplicaState, ReplicaType};
use crate::writer::{AddReplicaOp, CollectionModification, StateProtocol};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Key of the config name on the collection metadata node
const CONFIG_NAME_PROP: &str = "configName";

/// Create the collection metadata node `/collections/<name>`.
///
/// A terms subtree left behind by an earlier collection of the same name is
/// removed first. An existing metadata node is kept; it only gets the config
/// name added when it has none.
pub async fn create_collection_metadata(
    store: &dyn DistributedStore,
    name: &str,
    config_name: &str,
    properties: &BTreeMap<String, String>,
) -> Result<()> {
    store.delete_recursive(&paths::collection_terms(name)).await?;

    let path = paths::collection(name);
    let mut data = properties.clone();
    data.insert(CONFIG_NAME_PROP.to_string(), config_name.to_string());
    let encoded = serde_json::to_vec(&data).map_err(StoreError::from)?;

    match store.make_path(&path, encoded, CreateMode::Persistent).await {
        Ok(_) => {
            debug!(collection = %name, config = %config_name, "Created collection metadata node");
            Ok(())
        }
        Err(StoreError::NodeExists(_)) => {
            let existing = read_json::<BTreeMap<String, String>>(store, &path).await.ok().flatten();
            let has_config = existing
                .as_ref()
                .map(|(props, _)| props.contains_key(CONFIG_NAME_PROP))
                .unwrap_or(false);
            if !has_config {
                let mut props = existing.map(|(props, _)| props).unwrap_or_default();
                props.insert(CONFIG_NAME_PROP.to_string(), config_name.to_string());
                write_json(store, &path, &props).await?;
            }
            debug!(collection = %name, "Collection metadata node already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// A replica registered by this run, with the node it lives on
struct PlacedReplica {
    position: ReplicaPosition,
    replica: Replica,
}

pub struct CreateCollectionCmd<'a> {
    ctx: &'a CommandContext,
}

impl<'a> CreateCollectionCmd<'a> {
    pub fn new(ctx: &'a CommandContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, request: &CreateCollectionRequest) -> Result<CreateCollectionResponse> {
        let start = Instant::now();
        info!(collection = %request.name, per_replica_state = request.per_replica_state, "Creating collection");

        let result = self.create(request).await;

        match &result {
            Ok(response) => {
                metrics::record_collection_created(
                    StateProtocol::from_flag(request.per_replica_state).as_str(),
                    response.core_count(),
                    start.elapsed(),
                );
                info!(
                    collection = %request.name,
                    cores = response.core_count(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Created collection"
                );
            }
            Err(e) => {
                metrics::record_command_failed("create_collection", e.error_type());
                warn!(collection = %request.name, error = %e, kind = ?e.kind(), "Collection creation failed");
            }
        }

        if let Some(async_id) = &request.async_id {
            let outcome = match &result {
                Ok(response) => AsyncOutcome {
                    success: response.success.clone(),
                    ..Default::default()
                },
                Err(e) => AsyncOutcome {
                    failures: match e {
                        ProvisionError::ProvisioningFailed { failures, .. } => failures.clone(),
                        _ => Vec::new(),
                    },
                    error: Some(e.to_string()),
                    ..Default::default()
                },
            };
            if let Err(e) = record_outcome(self.ctx.store.as_ref(), async_id, &outcome).await {
                error!(async_id = %async_id, error = %e, "Failed to record async outcome");
            }
        }

        result
    }

    async fn create(&self, request: &CreateCollectionRequest) -> Result<CreateCollectionResponse> {
        let name = request.name.as_str();
        validate_name(name)?;

        // Preconditions; nothing has been written yet
        let state = self.ctx.reader.refresh().await?;
        if state.has_collection(name) || self.ctx.store.exists(&paths::collection_state(name)).await? {
            return Err(ProvisionError::CollectionExists(name.to_string()));
        }
        if state.aliases().has_alias(name) {
            return Err(ProvisionError::AliasExists(name.to_string()));
        }

        let counts = request.replica_counts();
        check_replica_types(&counts)?;
        check_max_shards_per_node(request.max_shards_per_node)?;
        let shard_names = plan_shards(request.router, request.shards.as_deref(), request.num_shards)?;

        let companion = match &request.with_collection {
            Some(with) => {
                let real = state.aliases().resolve_simple_alias(with);
                let companion = state
                    .collection(real)
                    .ok_or_else(|| ProvisionError::InvalidRequest(format!("The 'withCollection' does not exist: {}", real)))?;
                let active = companion.active_shards().len();
                if active > 1 {
                    return Err(ProvisionError::InvalidRequest(format!(
                        "The `withCollection` must have only one shard, found: {}",
                        active
                    )));
                }
                Some(real.to_string())
            }
            None => None,
        };

        let config_name =
            resolve_config_name(self.ctx.configsets.as_ref(), name, request.config_name.as_deref()).await?;
        let mut warnings = Vec::new();
        if config_name == DEFAULT_CONFIGSET || (request.config_name.is_none() && config_name == autocreated_name(name)) {
            warnings.push(DEFAULT_CONFIGSET_WARNING.to_string());
        }

        // Step 1
        let collection = Collection {
            name: name.to_string(),
            router: request.router,
            shards: build_shards(request.router, &shard_names),
            config_name: config_name.clone(),
            per_replica_state: request.per_replica_state,
            max_shards_per_node: request.max_shards_per_node,
            nrt_replicas: counts.nrt,
            tlog_replicas: counts.tlog,
            pull_replicas: counts.pull,
            colocated_with: None,
            with_collection: companion.clone(),
            properties: request.collection_params.clone(),
        };
        let protocol = StateProtocol::of(&collection);

        // Step 2
        create_collection_metadata(self.ctx.store.as_ref(), name, &config_name, &request.collection_params).await?;

        let success = match self.provision(request, &collection, protocol, &counts).await {
            Ok(success) => success,
            // Lost a race with another creator of the same name: the record is theirs
            Err(e @ ProvisionError::CollectionExists(_)) => return Err(e),
            Err(e) => {
                self.rollback(name, &e).await;
                return Err(e);
            }
        };

        // Step 10
        if let Some(companion) = &companion {
            self.link_companion(companion, name).await;
        }

        // Step 11
        match &request.alias {
            Some(alias) if alias != name => {
                self.ctx.aliases().add_collection_alias(alias, name).await?;
            }
            _ => {}
        }

        Ok(CreateCollectionResponse {
            success,
            warnings,
            async_id: request.async_id.clone(),
        })
    }

    /// Steps 3 to 9. Any error returned here requires a rollback.
    async fn provision(
        &self,
        request: &CreateCollectionRequest,
        collection: &Collection,
        protocol: StateProtocol,
        counts: &ReplicaCounts,
    ) -> Result<BTreeMap<String, Vec<CoreAck>>> {
        let name = collection.name.as_str();

        // Step 3
        self.ctx.writer.publish_initial(collection).await?;
        if protocol == StateProtocol::Queued {
            let visible = self
                .ctx
                .wait_for_state(self.ctx.config.visibility_poll(), |s| s.has_collection(name))
                .await?;
            if visible.is_none() {
                return Err(ProvisionError::Server(format!("Could not fully create collection: {}", name)));
            }
        }

        // Step 4
        let lease = self.ctx.sessions.acquire(name);
        let positions = self.place(collection, counts, &lease).await?;

        // Step 5
        if positions.is_empty() {
            warn!(collection = %name, "No live nodes, created collection without cores");
            lease.release();
            return Ok(BTreeMap::new());
        }

        // Step 6
        if let Some(companion) = &collection.with_collection {
            self.ensure_companion_replicas(companion, &positions).await?;
        }

        // Step 7
        let placed = self.register_replicas(collection, protocol, positions).await?;

        // Step 8
        let tracker = ShardRequestTracker::new(
            self.ctx.core_admin.clone(),
            request.async_id.clone(),
            self.ctx.config.rpc_timeout(),
            self.ctx.config.poll_interval(),
        );
        let requests = placed
            .iter()
            .map(|p| ShardRequest {
                node: p.position.node.clone(),
                request: CreateCoreRequest {
                    core: p.replica.core.clone(),
                    collection: name.to_string(),
                    shard: p.position.shard.clone(),
                    replica_type: p.position.replica_type,
                    config_name: collection.config_name.clone(),
                    num_shards: collection.shards.len() as u32,
                    replica_name: Some(p.replica.name.clone()),
                    async_id: tracker.next_async_id(),
                    properties: request.core_properties.clone(),
                },
            })
            .collect();
        let responses = tracker.submit_all(requests).await;
        if !responses.is_success() {
            return Err(ProvisionError::ProvisioningFailed {
                collection: name.to_string(),
                failures: responses.failures,
            });
        }

        // Step 9
        if protocol == StateProtocol::Direct || request.wait_for_final_state {
            self.wait_for_active(name, &placed).await?;
        }

        lease.release();
        Ok(responses.success_by_node())
    }

    /// Run placement against the refreshed state with the new collection overlaid
    async fn place(
        &self,
        collection: &Collection,
        counts: &ReplicaCounts,
        lease: &SessionLease,
    ) -> Result<Vec<ReplicaPosition>> {
        let state = self.ctx.reader.refresh().await?;
        let strategy = AssignStrategy::for_policy(state.placement_policy());
        let request = AssignRequest {
            collection: collection.name.clone(),
            shard_names: collection.shards.iter().map(|s| s.name.clone()).collect(),
            counts: *counts,
            nodes: state.live_nodes().iter().cloned().collect(),
            max_shards_per_node: collection.max_shards_per_node,
        };
        let overlay = OverlayClusterState::new(state, collection.clone());
        Ok(strategy.assign(&request, &overlay, lease)?)
    }

    async fn ensure_companion_replicas(&self, companion: &str, positions: &[ReplicaPosition]) -> Result<()> {
        let nodes: BTreeSet<&str> = positions.iter().map(|p| p.node.as_str()).collect();
        let state = self.ctx.reader.refresh().await?;
        let Some(existing) = state.collection(companion) else {
            return Err(ProvisionError::Server(format!("Companion collection {} disappeared", companion)));
        };
        let Some(shard) = existing.active_shards().first().map(|s| s.name.clone()) else {
            return Err(ProvisionError::Server(format!("Companion collection {} has no active shard", companion)));
        };

        for node in nodes {
            if existing.replicas_on_node(node).next().is_some() {
                continue;
            }
            debug!(companion = %companion, node = %node, "Adding companion replica");
            let mut add = AddReplicaRequest::new(companion, shard.clone(), node);
            add.replica_type = ReplicaType::Nrt;
            add.wait_for_final_state = true;
            AddReplicaCmd::new(self.ctx).run(&add).await?;
        }
        self.ctx.reader.refresh().await?;
        Ok(())
    }

    /// Allocate core names and register every replica
    async fn register_replicas(
        &self,
        collection: &Collection,
        protocol: StateProtocol,
        positions: Vec<ReplicaPosition>,
    ) -> Result<Vec<PlacedReplica>> {
        let name = collection.name.as_str();
        let mut ops = Vec::with_capacity(positions.len());
        for position in &positions {
            let core = allocate_core_name(
                self.ctx.store.as_ref(),
                name,
                &position.shard,
                position.replica_type,
                self.ctx.config.max_cas_retries,
            )
            .await?;
            ops.push(AddReplicaOp {
                collection: name.to_string(),
                shard: position.shard.clone(),
                core,
                replica_name: None,
                node_name: position.node.clone(),
                base_url: self.ctx.nodes.base_url(&position.node).await?,
                replica_type: position.replica_type,
                state: ReplicaState::Down,
            });
        }

        let mut registered = Vec::with_capacity(ops.len());
        for op in &ops {
            registered.push(self.ctx.writer.publish_replica(protocol, op).await?);
        }

        // Queued registrations only exist once the overseer has applied them
        let view = if protocol == StateProtocol::Queued {
            let cores: Vec<&str> = ops.iter().map(|op| op.core.as_str()).collect();
            let state = self
                .ctx
                .wait_for_state(self.ctx.config.visibility_poll(), |s| {
                    s.collection(name)
                        .map(|c| cores.iter().all(|core| c.replica_by_core(core).is_some()))
                        .unwrap_or(false)
                })
                .await?
                .ok_or_else(|| {
                    ProvisionError::Server(format!("Could not find replicas of {} in the cluster state", name))
                })?;
            Some(state)
        } else {
            None
        };

        let mut placed = Vec::with_capacity(ops.len());
        for ((position, op), replica) in positions.into_iter().zip(&ops).zip(registered) {
            let replica = match (replica, &view) {
                (Some(replica), _) => replica,
                (None, Some(state)) => state
                    .collection(name)
                    .and_then(|c| c.replica_by_core(&op.core))
                    .cloned()
                    .ok_or_else(|| ProvisionError::Server(format!("replica {} is not registered", op.core)))?,
                (None, None) => {
                    return Err(ProvisionError::Server(format!("replica {} is not registered", op.core)));
                }
            };
            placed.push(PlacedReplica { position, replica });
        }
        Ok(placed)
    }

    async fn wait_for_active(&self, name: &str, placed: &[PlacedReplica]) -> Result<()> {
        let is_active = |state: &crate::state::ClusterState, core: &str| {
            state
                .collection(name)
                .and_then(|c| c.replica_by_core(core))
                .map(|r| r.state == ReplicaState::Active)
                .unwrap_or(false)
        };

        let ready = self
            .ctx
            .wait_for_state(self.ctx.config.active_poll(), |s| {
                placed.iter().all(|p| is_active(s, &p.replica.core))
            })
            .await?;
        if ready.is_some() {
            return Ok(());
        }

        let state = self.ctx.reader.current();
        let failures = placed
            .iter()
            .filter(|p| !is_active(&*state, &p.replica.core))
            .map(|p| NodeFailure::new(&p.position.node, &p.replica.core, "replica did not become active"))
            .collect();
        Err(ProvisionError::ProvisioningFailed {
            collection: name.to_string(),
            failures,
        })
    }

    /// Record `colocated_with` on the companion; a slow link is only logged
    async fn link_companion(&self, companion: &str, name: &str) {
        let state = self.ctx.reader.current();
        let protocol = state
            .collection(companion)
            .map(StateProtocol::of)
            .unwrap_or(StateProtocol::Queued);
        let modification = CollectionModification {
            colocated_with: Some(name.to_string()),
            properties: BTreeMap::new(),
        };
        if let Err(e) = self.ctx.writer.modify_collection(protocol, companion, &modification).await {
            warn!(companion = %companion, collection = %name, error = %e, "Could not link companion collection");
            return;
        }

        let linked = self
            .ctx
            .wait_for_state(self.ctx.config.colocation_poll(), |s| {
                s.collection(companion)
                    .and_then(|c| c.colocated_with.as_deref())
                    .map(|c| c == name)
                    .unwrap_or(false)
            })
            .await;
        match linked {
            Ok(Some(_)) => debug!(companion = %companion, collection = %name, "Linked companion collection"),
            Ok(None) => warn!(
                companion = %companion,
                collection = %name,
                "Timed out waiting for the colocation link on the companion collection"
            ),
            Err(e) => warn!(companion = %companion, error = %e, "Could not confirm colocation link"),
        }
    }

    async fn rollback(&self, name: &str, cause: &ProvisionError) {
        metrics::record_rollback(cause.error_type());
        warn!(collection = %name, error = %cause, "Cleaning up after failed collection creation");
        if let Err(e) = DeleteCollectionCmd::new(self.ctx).run(name).await {
            error!(collection = %name, error = %e, "Cleanup of failed collection failed");
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ProvisionError::InvalidRequest("collection name must not be empty".to_string()));
    }
    if let Some(c) = name.chars().find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))) {
        return Err(ProvisionError::InvalidRequest(format!(
            "Invalid collection name: {}. Collection names must consist entirely of periods, underscores, hyphens, and alphanumerics (found '{}')",
            name, c
        )));
    }
    if name.starts_with('-') {
        return Err(ProvisionError::InvalidRequest(format!(
            "Invalid collection name: {}. Collection names must not start with a hyphen",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("foo").is_ok());
        assert!(validate_name(".system").is_ok());
        assert!(validate_name("logs_2024-01").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("-foo").is_err());
    }

    #[tokio::test]
    async fn test_metadata_node_is_idempotent() {
        let store = MemoryStore::new();
        let mut props = BTreeMap::new();
        props.insert("owner".to_string(), "search".to_string());

        create_collection_metadata(&store, "foo", "conf", &props).await.unwrap();
        let first = store.get("/collections/foo").await.unwrap().unwrap();

        create_collection_metadata(&store, "foo", "conf", &props).await.unwrap();
        let second = store.get("/collections/foo").await.unwrap().unwrap();
        assert_eq!(first, second);

        let (stored, _): (BTreeMap<String, String>, i32) =
            read_json(&store, "/collections/foo").await.unwrap().unwrap();
        assert_eq!(stored.get("configName").map(String::as_str), Some("conf"));
        assert_eq!(stored.get("owner").map(String::as_str), Some("search"));
    }

    #[tokio::test]
    async fn test_metadata_node_drops_stale_terms() {
        let store = MemoryStore::new();
        store
            .make_path("/collections/foo/terms/shard1", b"{}".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        create_collection_metadata(&store, "foo", "conf", &BTreeMap::new()).await.unwrap();
        assert!(!store.exists("/collections/foo/terms").await.unwrap());
        // The pre-existing empty node picked up the config name
        let (stored, _): (BTreeMap<String, String>, i32) =
            read_json(&store, "/collections/foo").await.unwrap().unwrap();
        assert_eq!(stored.get("configName").map(String::as_str), Some("conf"));
    }
}
