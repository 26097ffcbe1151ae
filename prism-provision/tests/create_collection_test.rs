//! End-to-end collection creation against a single-process cluster

use prism_provision::configset::DEFAULT_CONFIGSET_WARNING;
use prism_provision::state::{AliasManager, ClusterStateView};
use prism_provision::{
    fetch_async_outcome, CreateCollectionRequest, ErrorKind, LocalCluster, NodeProperties, ProvisionConfig,
    ProvisionError, ReplicaState,
};
use std::collections::BTreeSet;
use std::time::Duration;

fn fast_config() -> ProvisionConfig {
    ProvisionConfig {
        poll_interval_ms: 5,
        visibility_timeout_ms: 3000,
        active_timeout_ms: 3000,
        colocation_timeout_ms: 1000,
        rpc_timeout_ms: 3000,
        ..Default::default()
    }
}

async fn cluster_with_nodes(nodes: &[&str]) -> LocalCluster {
    cluster_with_config(fast_config(), nodes).await
}

async fn cluster_with_config(config: ProvisionConfig, nodes: &[&str]) -> LocalCluster {
    let cluster = LocalCluster::start(config);
    for node in nodes {
        cluster.add_node(node, NodeProperties::default()).await.unwrap();
    }
    cluster.upload_config("conf").await.unwrap();
    cluster
}

/// Wait until the overseer has nothing left to apply
async fn drain_queue(cluster: &LocalCluster) {
    let queue = cluster.context().writer.queue();
    for _ in 0..400 {
        if queue.is_empty().await.unwrap() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("state-update queue did not drain");
}

fn total_cores(cluster: &LocalCluster, nodes: &[&str]) -> usize {
    nodes.iter().map(|n| cluster.agent(n).unwrap().core_count()).sum()
}

#[tokio::test]
async fn test_two_shards_on_distinct_nodes() {
    let nodes = ["node-a", "node-b", "node-c"];
    let cluster = cluster_with_nodes(&nodes).await;

    let request = CreateCollectionRequest::new("foo")
        .with_num_shards(2)
        .with_replicas(1, 0, 0)
        .with_config("conf")
        .with_max_shards_per_node(1);
    let response = cluster.create_collection(&request).await.unwrap();

    assert!(response.warnings.is_empty());
    assert_eq!(response.core_count(), 2);
    assert_eq!(response.success.len(), 2);

    let state = cluster.context().reader.refresh().await.unwrap();
    let foo = state.collection("foo").unwrap();
    assert_eq!(foo.replica_count(), 2);
    let used: BTreeSet<&str> = foo.replicas().map(|r| r.node_name.as_str()).collect();
    assert_eq!(used.len(), 2);
    assert_eq!(total_cores(&cluster, &nodes), 2);
    assert_eq!(nodes.iter().filter(|n| cluster.agent(n).unwrap().core_count() == 0).count(), 1);
    assert_eq!(cluster.context().sessions.active_leases(), 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_capacity_exceeded_before_any_core() {
    let nodes = ["node-a", "node-b"];
    let cluster = cluster_with_nodes(&nodes).await;

    let request = CreateCollectionRequest::new("bar")
        .with_shards("s1,s2,s3")
        .with_replicas(2, 0, 0)
        .with_config("conf")
        .with_max_shards_per_node(1);
    let err = cluster.create_collection(&request).await.unwrap_err();

    assert!(matches!(err, ProvisionError::CapacityExceeded(_)));
    assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
    assert!(err.is_client_error());
    let message = err.to_string();
    assert!(message.contains("maximum of 2"), "{}", message);
    assert!(message.contains("requires 6"), "{}", message);

    assert_eq!(total_cores(&cluster, &nodes), 0);
    drain_queue(&cluster).await;
    assert!(cluster.store().paths_under("/collections/bar").is_empty());
    assert_eq!(cluster.context().sessions.active_leases(), 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_name_collision_leaves_store_unchanged() {
    let cluster = cluster_with_nodes(&["node-a", "node-b"]).await;
    let request = CreateCollectionRequest::new("foo")
        .with_num_shards(1)
        .with_replicas(1, 0, 0)
        .with_config("conf")
        .with_per_replica_state(true);
    cluster.create_collection(&request).await.unwrap();

    let before = cluster.store().snapshot();
    let err = cluster.create_collection(&request).await.unwrap_err();
    assert!(matches!(err, ProvisionError::CollectionExists(_)));
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
    assert_eq!(cluster.store().snapshot(), before);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_alias_collision_leaves_store_unchanged() {
    let cluster = cluster_with_nodes(&["node-a"]).await;
    let aliases = AliasManager::new(cluster.context().store.clone(), 5);
    aliases.add_collection_alias("logs", "logs_2024").await.unwrap();

    let before = cluster.store().snapshot();
    let request = CreateCollectionRequest::new("logs").with_num_shards(1).with_config("conf");
    let err = cluster.create_collection(&request).await.unwrap_err();
    assert!(matches!(err, ProvisionError::AliasExists(_)));
    assert_eq!(cluster.store().snapshot(), before);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_missing_config_is_rejected_without_writes() {
    let cluster = cluster_with_nodes(&["node-a"]).await;
    let before = cluster.store().snapshot();

    let request = CreateCollectionRequest::new("foo").with_num_shards(1).with_config("nope");
    let err = cluster.create_collection(&request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigurationNotFound);
    assert_eq!(cluster.store().snapshot(), before);

    cluster.shutdown().await;
}

async fn assert_rollback_on_core_failure(per_replica_state: bool) {
    let nodes = ["node-a", "node-b", "node-c"];
    let cluster = cluster_with_nodes(&nodes).await;
    cluster.agent("node-b").unwrap().set_fail_creates(true);

    let request = CreateCollectionRequest::new("foo")
        .with_num_shards(3)
        .with_replicas(1, 0, 0)
        .with_config("conf")
        .with_per_replica_state(per_replica_state);
    let err = cluster.create_collection(&request).await.unwrap_err();

    match &err {
        ProvisionError::ProvisioningFailed { collection, failures } => {
            assert_eq!(collection, "foo");
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].node, "node-b");
        }
        other => panic!("unexpected error: {:?}", other),
    }

    drain_queue(&cluster).await;
    let state = cluster.context().reader.refresh().await.unwrap();
    assert!(!state.has_collection("foo"));
    assert!(cluster.store().paths_under("/collections/foo").is_empty());
    assert_eq!(total_cores(&cluster, &nodes), 0);
    assert_eq!(cluster.context().sessions.active_leases(), 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_rollback_on_core_failure_queued() {
    assert_rollback_on_core_failure(false).await;
}

#[tokio::test]
async fn test_rollback_on_core_failure_direct() {
    assert_rollback_on_core_failure(true).await;
}

#[tokio::test]
async fn test_rollback_when_replicas_never_activate() {
    let cluster = cluster_with_nodes(&["node-a", "node-b"]).await;
    cluster.agent("node-a").unwrap().set_report_active(false);

    let request = CreateCollectionRequest::new("slow")
        .with_num_shards(2)
        .with_replicas(1, 0, 0)
        .with_config("conf")
        .with_per_replica_state(true);
    match cluster.create_collection(&request).await.unwrap_err() {
        ProvisionError::ProvisioningFailed { failures, .. } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].node, "node-a");
            assert_eq!(failures[0].message, "replica did not become active");
        }
        other => panic!("unexpected error: {:?}", other),
    }

    assert!(cluster.store().paths_under("/collections/slow").is_empty());
    assert_eq!(total_cores(&cluster, &["node-a", "node-b"]), 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_both_protocols_reach_active() {
    let cluster = cluster_with_nodes(&["node-a", "node-b"]).await;

    for (name, per_replica_state) in [("queued", false), ("direct", true)] {
        let mut request = CreateCollectionRequest::new(name)
            .with_num_shards(2)
            .with_replicas(1, 0, 0)
            .with_config("conf")
            .with_per_replica_state(per_replica_state);
        request.wait_for_final_state = true;
        cluster.create_collection(&request).await.unwrap();

        let state = cluster.context().reader.refresh().await.unwrap();
        let collection = state.collection(name).unwrap();
        assert_eq!(collection.per_replica_state, per_replica_state);
        assert!(collection.replicas().all(|r| r.state == ReplicaState::Active));
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_alias_equal_to_name_is_noop() {
    let cluster = cluster_with_nodes(&["node-a"]).await;

    let request = CreateCollectionRequest::new("foo")
        .with_num_shards(1)
        .with_config("conf")
        .with_alias("foo");
    cluster.create_collection(&request).await.unwrap();
    assert!(!cluster.context().store.exists("/aliases.json").await.unwrap());

    let request = CreateCollectionRequest::new("bar")
        .with_num_shards(1)
        .with_config("conf")
        .with_alias("bar_alias");
    cluster.create_collection(&request).await.unwrap();
    let state = cluster.context().reader.refresh().await.unwrap();
    assert_eq!(state.aliases().resolve_simple_alias("bar_alias"), "bar");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_default_config_warning() {
    let cluster = cluster_with_nodes(&["node-a"]).await;
    cluster.upload_config("_default").await.unwrap();

    let request = CreateCollectionRequest::new("scratch").with_num_shards(1);
    let response = cluster.create_collection(&request).await.unwrap();
    assert_eq!(response.warnings, vec![DEFAULT_CONFIGSET_WARNING.to_string()]);

    let state = cluster.context().reader.refresh().await.unwrap();
    assert_eq!(state.collection("scratch").unwrap().config_name, "scratch.AUTOCREATED");
    assert!(cluster.context().store.exists("/configs/scratch.AUTOCREATED").await.unwrap());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_no_live_nodes_creates_empty_collection() {
    let cluster = cluster_with_nodes(&[]).await;

    let request = CreateCollectionRequest::new("empty")
        .with_num_shards(2)
        .with_config("conf")
        .with_per_replica_state(true);
    let response = cluster.create_collection(&request).await.unwrap();
    assert!(response.success.is_empty());

    let state = cluster.context().reader.refresh().await.unwrap();
    let collection = state.collection("empty").unwrap();
    assert_eq!(collection.shards.len(), 2);
    assert_eq!(collection.replica_count(), 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_companion_collection_is_colocated() {
    let nodes = ["node-a", "node-b", "node-c"];
    let cluster = cluster_with_nodes(&nodes).await;

    let companion = CreateCollectionRequest::new("lookup")
        .with_num_shards(1)
        .with_replicas(1, 0, 0)
        .with_config("conf");
    cluster.create_collection(&companion).await.unwrap();

    let request = CreateCollectionRequest::new("orders")
        .with_num_shards(2)
        .with_replicas(1, 0, 0)
        .with_config("conf")
        .with_max_shards_per_node(-1)
        .with_collection("lookup");
    cluster.create_collection(&request).await.unwrap();
    drain_queue(&cluster).await;

    let state = cluster.context().reader.refresh().await.unwrap();
    let orders = state.collection("orders").unwrap();
    let lookup = state.collection("lookup").unwrap();
    assert_eq!(orders.with_collection.as_deref(), Some("lookup"));
    assert_eq!(lookup.colocated_with.as_deref(), Some("orders"));
    for replica in orders.replicas() {
        assert!(
            lookup.replicas_on_node(&replica.node_name).next().is_some(),
            "no companion replica on {}",
            replica.node_name
        );
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_companion_must_exist() {
    let cluster = cluster_with_nodes(&["node-a"]).await;
    let request = CreateCollectionRequest::new("orders")
        .with_num_shards(1)
        .with_config("conf")
        .with_collection("missing");
    let err = cluster.create_collection(&request).await.unwrap_err();
    assert!(matches!(err, ProvisionError::InvalidRequest(_)));
    assert!(!cluster.context().store.exists("/collections/orders").await.unwrap());

    // The message names the collection the alias points at
    let aliases = AliasManager::new(cluster.context().store.clone(), 5);
    aliases.add_collection_alias("lookup", "lookup_v2").await.unwrap();
    let request = CreateCollectionRequest::new("orders")
        .with_num_shards(1)
        .with_config("conf")
        .with_collection("lookup");
    let message = cluster.create_collection(&request).await.unwrap_err().to_string();
    assert!(message.contains("does not exist: lookup_v2"), "{}", message);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_companion_with_several_shards_is_rejected() {
    let cluster = cluster_with_nodes(&["node-a", "node-b"]).await;
    let companion = CreateCollectionRequest::new("lookup")
        .with_num_shards(2)
        .with_replicas(1, 0, 0)
        .with_config("conf")
        .with_per_replica_state(true);
    cluster.create_collection(&companion).await.unwrap();
    drain_queue(&cluster).await;

    let before = cluster.store().snapshot();
    let request = CreateCollectionRequest::new("orders")
        .with_num_shards(1)
        .with_config("conf")
        .with_collection("lookup");
    let err = cluster.create_collection(&request).await.unwrap_err();
    assert!(matches!(err, ProvisionError::InvalidRequest(_)));
    assert!(err.to_string().contains("must have only one shard, found: 2"), "{}", err);
    assert_eq!(cluster.store().snapshot(), before);

    cluster.shutdown().await;
}

/// Stop applying queued state updates and give the loop time to exit
async fn stop_overseer(cluster: &LocalCluster) {
    cluster.overseer().stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_queued_record_never_visible_is_fatal() {
    let config = ProvisionConfig {
        visibility_timeout_ms: 200,
        ..fast_config()
    };
    let nodes = ["node-a", "node-b"];
    let cluster = cluster_with_config(config, &nodes).await;
    stop_overseer(&cluster).await;

    let request = CreateCollectionRequest::new("stuck")
        .with_num_shards(1)
        .with_replicas(1, 0, 0)
        .with_config("conf");
    let err = cluster.create_collection(&request).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Server(_)), "{:?}", err);
    assert!(err.to_string().contains("Could not fully create collection: stuck"), "{}", err);

    assert_eq!(total_cores(&cluster, &nodes), 0);
    assert!(!cluster.context().store.exists("/collections/stuck").await.unwrap());
    assert_eq!(cluster.context().sessions.active_leases(), 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_slow_colocation_link_is_tolerated() {
    let config = ProvisionConfig {
        colocation_timeout_ms: 100,
        ..fast_config()
    };
    let cluster = cluster_with_config(config, &["node-a"]).await;

    // Queued companion, so its link waits on the overseer
    let companion = CreateCollectionRequest::new("lookup")
        .with_num_shards(1)
        .with_replicas(1, 0, 0)
        .with_config("conf");
    cluster.create_collection(&companion).await.unwrap();
    drain_queue(&cluster).await;
    stop_overseer(&cluster).await;

    let request = CreateCollectionRequest::new("orders")
        .with_num_shards(1)
        .with_replicas(1, 0, 0)
        .with_config("conf")
        .with_per_replica_state(true)
        .with_collection("lookup");
    let response = cluster.create_collection(&request).await.unwrap();
    assert_eq!(response.core_count(), 1);

    let state = cluster.context().reader.refresh().await.unwrap();
    assert_eq!(state.collection("orders").unwrap().with_collection.as_deref(), Some("lookup"));
    assert_eq!(state.collection("lookup").unwrap().colocated_with, None);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_async_outcome_is_recorded() {
    let cluster = cluster_with_nodes(&["node-a", "node-b"]).await;

    let request = CreateCollectionRequest::new("foo")
        .with_num_shards(2)
        .with_replicas(1, 0, 0)
        .with_config("conf")
        .with_async_id("req-7");
    let response = cluster.create_collection(&request).await.unwrap();
    assert_eq!(response.async_id.as_deref(), Some("req-7"));
    assert!(response.success.values().flatten().all(|ack| ack.async_id.is_some()));

    let outcome = fetch_async_outcome(cluster.context().store.as_ref(), "req-7")
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.success.values().map(Vec::len).sum::<usize>(), 2);

    cluster.agent("node-b").unwrap().set_fail_creates(true);
    let request = CreateCollectionRequest::new("bar")
        .with_num_shards(2)
        .with_replicas(1, 0, 0)
        .with_config("conf")
        .with_async_id("req-8");
    cluster.create_collection(&request).await.unwrap_err();
    let outcome = fetch_async_outcome(cluster.context().store.as_ref(), "req-8")
        .await
        .unwrap()
        .unwrap();
    assert!(!outcome.is_success());
    assert_eq!(outcome.failures.len(), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_collection_and_core_properties() {
    let cluster = cluster_with_nodes(&["node-a"]).await;

    let mut request = CreateCollectionRequest::new("foo").with_num_shards(1).with_config("conf");
    request.collection_params.insert("owner".into(), "search".into());
    request.core_properties.insert("dataDir".into(), "/data/foo".into());
    let response = cluster.create_collection(&request).await.unwrap();

    let core = &response.success["node-a"][0].core;
    let hosted = cluster.agent("node-a").unwrap().core(core).unwrap();
    assert_eq!(hosted.properties.get("dataDir").map(String::as_str), Some("/data/foo"));

    let node = cluster.context().store.get("/collections/foo").await.unwrap().unwrap();
    let props: serde_json::Value = serde_json::from_slice(&node.data).unwrap();
    assert_eq!(props["owner"], "search");
    assert_eq!(props["configName"], "conf");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_create_over_tarpc() {
    let cluster = LocalCluster::start_with_rpc(fast_config());
    cluster.add_node("node-a", NodeProperties::default()).await.unwrap();
    cluster.add_node("node-b", NodeProperties::default()).await.unwrap();
    cluster.upload_config("conf").await.unwrap();

    let request = CreateCollectionRequest::new("foo")
        .with_num_shards(2)
        .with_replicas(1, 0, 0)
        .with_config("conf")
        .with_per_replica_state(true);
    let response = cluster.create_collection(&request).await.unwrap();
    assert_eq!(response.core_count(), 2);
    assert_eq!(total_cores(&cluster, &["node-a", "node-b"]), 2);

    cluster.delete_collection("foo").await.unwrap();
    assert_eq!(total_cores(&cluster, &["node-a", "node-b"]), 0);
    assert!(cluster.store().paths_under("/collections/foo").is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_creations_spread_load() {
    let nodes = ["node-a", "node-b", "node-c", "node-d"];
    let cluster = cluster_with_nodes(&nodes).await;

    let first = CreateCollectionRequest::new("one")
        .with_num_shards(2)
        .with_replicas(1, 0, 0)
        .with_config("conf")
        .with_per_replica_state(true);
    let second = CreateCollectionRequest::new("two")
        .with_num_shards(2)
        .with_replicas(1, 0, 0)
        .with_config("conf")
        .with_per_replica_state(true);
    let (a, b) = tokio::join!(cluster.create_collection(&first), cluster.create_collection(&second));
    a.unwrap();
    b.unwrap();

    assert_eq!(total_cores(&cluster, &nodes), 4);
    assert_eq!(cluster.context().sessions.active_leases(), 0);

    cluster.shutdown().await;
}
