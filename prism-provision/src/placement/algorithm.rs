//! Placement algorithms
//!
//! Both strategies share one loop: walk shards in order, replica types in
//! NRT, TLOG, PULL order, and fill each slot from the nodes still under the
//! per-node cap. They differ only in how a node is picked from that set.

use super::{AssignRequest, PlacementPolicy, RankFactor, ReplicaPosition, SpreadLevel};
use crate::state::ClusterStateView;
use crate::types::{NodeProperties, ReplicaType};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Errors that can occur during placement
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    #[error("Cannot create collection {collection}. Value of maxShardsPerNode is {max_shards_per_node}, and the number of nodes currently live is {live_nodes}. This allows a maximum of {max_allowed} to be created. Value of numShards is {num_shards}, value of nrtReplicas is {nrt_replicas}, value of tlogReplicas is {tlog_replicas} and value of pullReplicas is {pull_replicas}. This requires {requested} shards to be created (higher than the allowed number)")]
    CapacityExceeded {
        collection: String,
        max_shards_per_node: i32,
        live_nodes: usize,
        max_allowed: usize,
        num_shards: usize,
        nrt_replicas: u32,
        tlog_replicas: u32,
        pull_replicas: u32,
        requested: usize,
    },

    #[error("No eligible node for a {replica_type} replica of {collection}/{shard}")]
    NoEligibleNodes {
        collection: String,
        shard: String,
        replica_type: ReplicaType,
    },

    #[error("Required attribute not satisfied by any live node: {0}={1}")]
    RequiredAttributeMissing(String, String),
}

/// `maxShardsPerNode * live nodes` must cover `numShards * replicas per shard`
pub fn check_capacity(request: &AssignRequest) -> Result<(), PlacementError> {
    let Some(cap) = request.per_node_cap() else {
        return Ok(());
    };
    let max_allowed = cap * request.nodes.len();
    let requested = request.requested_replicas();
    if max_allowed < requested {
        return Err(PlacementError::CapacityExceeded {
            collection: request.collection.clone(),
            max_shards_per_node: request.max_shards_per_node,
            live_nodes: request.nodes.len(),
            max_allowed,
            num_shards: request.shard_names.len(),
            nrt_replicas: request.counts.nrt,
            tlog_replicas: request.counts.tlog,
            pull_replicas: request.counts.pull,
            requested,
        });
    }
    Ok(())
}

/// Load of candidate nodes while a placement run progresses
#[derive(Debug, Clone, Default)]
pub struct NodeLoads {
    cores: HashMap<String, usize>,
    collection: HashMap<String, usize>,
    shard_nodes: HashMap<String, Vec<String>>,
}

impl NodeLoads {
    /// Start from existing cores in `view` plus cores reserved by other runs
    pub fn build(request: &AssignRequest, view: &dyn ClusterStateView, in_flight: &HashMap<String, usize>) -> Self {
        let mut loads = NodeLoads::default();
        for node in &request.nodes {
            let cores = view.cores_on_node(node) + in_flight.get(node).copied().unwrap_or(0);
            loads.cores.insert(node.clone(), cores);
        }
        if let Some(existing) = view.collection(&request.collection) {
            for replica in existing.replicas() {
                *loads.collection.entry(replica.node_name.clone()).or_insert(0) += 1;
                loads
                    .shard_nodes
                    .entry(replica.shard.clone())
                    .or_default()
                    .push(replica.node_name.clone());
            }
        }
        loads
    }

    /// All cores on `node`, including those assigned in this run
    pub fn cores(&self, node: &str) -> usize {
        self.cores.get(node).copied().unwrap_or(0)
    }

    /// Replicas of the collection being placed on `node`
    pub fn collection_replicas(&self, node: &str) -> usize {
        self.collection.get(node).copied().unwrap_or(0)
    }

    pub fn hosts_shard(&self, shard: &str, node: &str) -> bool {
        self.shard_nodes
            .get(shard)
            .map(|nodes| nodes.iter().any(|n| n == node))
            .unwrap_or(false)
    }

    fn nodes_of_shard(&self, shard: &str) -> &[String] {
        self.shard_nodes.get(shard).map(|v| v.as_slice()).unwrap_or(&[])
    }

    fn record(&mut self, shard: &str, node: &str) {
        *self.cores.entry(node.to_string()).or_insert(0) += 1;
        *self.collection.entry(node.to_string()).or_insert(0) += 1;
        self.shard_nodes
            .entry(shard.to_string())
            .or_default()
            .push(node.to_string());
    }
}

fn assign_with<F>(request: &AssignRequest, loads: &mut NodeLoads, mut pick: F) -> Result<Vec<ReplicaPosition>, PlacementError>
where
    F: FnMut(&str, &[&String], &NodeLoads) -> Option<String>,
{
    let cap = request.per_node_cap();
    let mut positions = Vec::with_capacity(request.requested_replicas());

    for shard in &request.shard_names {
        for (replica_type, count) in request.counts.iter() {
            for index in 0..count as usize {
                let candidates: Vec<&String> = request
                    .nodes
                    .iter()
                    .filter(|n| cap.map_or(true, |cap| loads.collection_replicas(n) < cap))
                    .collect();
                let node = pick(shard, &candidates, loads).ok_or_else(|| PlacementError::NoEligibleNodes {
                    collection: request.collection.clone(),
                    shard: shard.clone(),
                    replica_type,
                })?;
                loads.record(shard, &node);
                positions.push(ReplicaPosition {
                    shard: shard.clone(),
                    index,
                    replica_type,
                    node,
                });
            }
        }
    }

    Ok(positions)
}

pub(super) fn assign_least_loaded(
    request: &AssignRequest,
    loads: &mut NodeLoads,
) -> Result<Vec<ReplicaPosition>, PlacementError> {
    assign_with(request, loads, |shard, candidates, loads| {
        candidates
            .iter()
            .min_by(|a, b| {
                (loads.hosts_shard(shard, a), loads.cores(a))
                    .cmp(&(loads.hosts_shard(shard, b), loads.cores(b)))
                    .then_with(|| a.cmp(b))
            })
            .map(|n| n.to_string())
    })
}

pub(super) fn assign_zone_aware(
    request: &AssignRequest,
    policy: &PlacementPolicy,
    view: &dyn ClusterStateView,
    loads: &mut NodeLoads,
) -> Result<Vec<ReplicaPosition>, PlacementError> {
    // Phase 1: hard constraints
    let eligible: HashSet<&str> = request
        .nodes
        .iter()
        .filter(|n| satisfies_required(view.node_properties(n), policy))
        .map(|n| n.as_str())
        .collect();
    if eligible.is_empty() {
        if let Some((key, value)) = policy.require.iter().next() {
            return Err(PlacementError::RequiredAttributeMissing(key.clone(), value.clone()));
        }
    }

    // Phase 2: spread, then score
    assign_with(request, loads, |shard, candidates, loads| {
        let candidates: Vec<&String> = candidates
            .iter()
            .copied()
            .filter(|n| eligible.contains(n.as_str()))
            .collect();

        let used_domains: HashSet<String> = loads
            .nodes_of_shard(shard)
            .iter()
            .map(|n| node_domain(n, view.node_properties(n), policy.spread))
            .collect();

        let fresh_domain: Vec<&String> = candidates
            .iter()
            .copied()
            .filter(|n| !loads.hosts_shard(shard, n))
            .filter(|n| !used_domains.contains(&node_domain(n, view.node_properties(n), policy.spread)))
            .collect();
        let not_hosting: Vec<&String> = candidates
            .iter()
            .copied()
            .filter(|n| !loads.hosts_shard(shard, n))
            .collect();

        let pool = if !fresh_domain.is_empty() {
            fresh_domain
        } else if !not_hosting.is_empty() {
            not_hosting
        } else {
            candidates
        };

        pool.into_iter()
            .map(|n| (n, score_node(view.node_properties(n), loads.cores(n), policy)))
            .max_by(|(a, score_a), (b, score_b)| {
                score_a
                    .partial_cmp(score_b)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| b.cmp(a))
            })
            .map(|(n, _)| n.clone())
    })
}

fn satisfies_required(props: Option<&NodeProperties>, policy: &PlacementPolicy) -> bool {
    policy.require.iter().all(|(key, value)| {
        props
            .and_then(|p| p.get_attribute(key))
            .map(|v| v == value)
            .unwrap_or(false)
    })
}

/// Get the domain identifier for a node based on spread level
fn node_domain(node: &str, props: Option<&NodeProperties>, spread_level: SpreadLevel) -> String {
    let zone = || props.and_then(|p| p.zone.clone());
    let domain = match spread_level {
        SpreadLevel::Zone => zone(),
        SpreadLevel::Rack => props.and_then(|p| p.rack.clone()).or_else(zone),
        SpreadLevel::Region => props.and_then(|p| p.region.clone()).or_else(zone),
        SpreadLevel::None => return node.to_string(),
    };
    domain.unwrap_or_else(|| "default".to_string())
}

/// Score a node for placement (higher is better)
pub fn score_node(props: Option<&NodeProperties>, cores: usize, policy: &PlacementPolicy) -> f64 {
    let mut score = 100.0;

    for factor in &policy.rank {
        match factor {
            RankFactor::FewestCores => {
                // Lower core count is better
                score -= cores as f64 * 5.0;
            }
            RankFactor::Ssd => {
                if props.map(|p| p.has_ssd()).unwrap_or(false) {
                    score += 20.0;
                }
            }
        }
    }

    // Bonus for preferred attributes
    for (key, value) in &policy.prefer {
        if props.and_then(|p| p.get_attribute(key)) == Some(value.as_str()) {
            score += 10.0;
        }
    }

    score
}
