//! Replica placement for new collections
//!
//! Placement turns an [`AssignRequest`] (shards, replica counts, candidate
//! nodes) into one [`ReplicaPosition`] per replica. It runs against a
//! [`ClusterStateView`] so existing cores count towards node load, and under a
//! [`SessionLease`] so replicas reserved by concurrent creations count too.
//!
//! # Strategies
//!
//! - **least-loaded** (default): per shard and replica type, pick the node
//!   that does not yet host the shard, then the one with the fewest cores,
//!   then the lexically smallest node id.
//! - **zone-aware**: used when a placement policy is stored. Nodes missing a
//!   required attribute are filtered out, spread domains not yet used by the
//!   shard are preferred, and the rest is decided by balance score.
//!
//! Both respect `maxShardsPerNode` for replicas of the collection.
//!
//! # Example
//!
//! ```ignore
//! use prism_provision::placement::{AssignStrategy, PlacementPolicy, SpreadLevel};
//!
//! let policy = PlacementPolicy {
//!     spread: SpreadLevel::Rack,
//!     ..Default::default()
//! };
//! let strategy = AssignStrategy::for_policy(Some(&policy));
//! let positions = strategy.assign(&request, &overlay, &lease)?;
//! ```

mod algorithm;
mod session;

pub use algorithm::{check_capacity, score_node, NodeLoads, PlacementError};
pub use session::{PlacementSessions, SessionLease};

use crate::planner::{ReplicaCounts, UNBOUNDED_SHARDS_PER_NODE};
use crate::state::ClusterStateView;
use crate::types::ReplicaType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Node property that separates failure domains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpreadLevel {
    #[default]
    Zone,
    /// Falls back to zone when the node has no rack
    Rack,
    Region,
    /// Every node is its own domain
    None,
}

/// Criteria used to rank candidates inside a spread domain, first wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RankFactor {
    #[default]
    FewestCores,
    Ssd,
}

/// Zone-aware placement rules, read from `/placement_policy.json`
///
/// ```json
/// {"spread": "rack", "rank": ["fewest_cores", "ssd"], "require": {"disk_type": "ssd"}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementPolicy {
    pub spread: SpreadLevel,
    pub rank: Vec<RankFactor>,
    /// Nodes lacking any of these properties are never chosen
    pub require: BTreeMap<String, String>,
    /// Matching properties add to the score
    pub prefer: BTreeMap<String, String>,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self {
            spread: SpreadLevel::Zone,
            rank: vec![RankFactor::FewestCores],
            require: BTreeMap::new(),
            prefer: BTreeMap::new(),
        }
    }
}

/// Input to a placement run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignRequest {
    pub collection: String,
    pub shard_names: Vec<String>,
    pub counts: ReplicaCounts,
    /// Candidate nodes, normally every live node
    pub nodes: Vec<String>,
    /// Positive limit or -1 for unbounded
    pub max_shards_per_node: i32,
}

impl AssignRequest {
    /// Per-node limit on replicas of this collection, `None` when unbounded
    pub fn per_node_cap(&self) -> Option<usize> {
        if self.max_shards_per_node == UNBOUNDED_SHARDS_PER_NODE {
            None
        } else {
            Some(self.max_shards_per_node.max(0) as usize)
        }
    }

    pub fn requested_replicas(&self) -> usize {
        self.shard_names.len() * self.counts.total() as usize
    }
}

/// Where one replica goes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaPosition {
    pub shard: String,
    /// Position among replicas of the same type in the shard
    pub index: usize,
    pub replica_type: ReplicaType,
    pub node: String,
}

/// Strategy table, keyed by policy identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignStrategy {
    LeastLoaded,
    ZoneAware(PlacementPolicy),
}

impl AssignStrategy {
    pub const LEAST_LOADED: &'static str = "least-loaded";
    pub const ZONE_AWARE: &'static str = "zone-aware";

    /// Zone-aware when a policy is stored, least-loaded otherwise
    pub fn for_policy(policy: Option<&PlacementPolicy>) -> Self {
        match policy {
            Some(policy) => AssignStrategy::ZoneAware(policy.clone()),
            None => AssignStrategy::LeastLoaded,
        }
    }

    /// Look up a strategy by identifier
    pub fn from_id(id: &str, policy: Option<&PlacementPolicy>) -> Option<Self> {
        match id {
            Self::LEAST_LOADED => Some(AssignStrategy::LeastLoaded),
            Self::ZONE_AWARE => Some(AssignStrategy::ZoneAware(policy.cloned().unwrap_or_default())),
            _ => None,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            AssignStrategy::LeastLoaded => Self::LEAST_LOADED,
            AssignStrategy::ZoneAware(_) => Self::ZONE_AWARE,
        }
    }

    /// Compute positions for every requested replica and reserve them on the lease.
    ///
    /// With no candidate nodes the result is empty, not an error.
    pub fn assign(
        &self,
        request: &AssignRequest,
        view: &dyn ClusterStateView,
        lease: &SessionLease,
    ) -> Result<Vec<ReplicaPosition>, PlacementError> {
        if request.nodes.is_empty() {
            warn!(
                collection = %request.collection,
                "It is unusual to create a collection without cores: no live nodes"
            );
            return Ok(Vec::new());
        }

        check_capacity(request)?;

        if request.counts.total() as usize > request.nodes.len() {
            warn!(
                collection = %request.collection,
                replicas_per_shard = request.counts.total(),
                live_nodes = request.nodes.len(),
                "Specified number of replicas is more than the number of live nodes; it is unusual to run two replica of the same slice on the same instance"
            );
        }

        let in_flight = lease.in_flight_cores(view);
        let mut loads = NodeLoads::build(request, view, &in_flight);
        let positions = match self {
            AssignStrategy::LeastLoaded => algorithm::assign_least_loaded(request, &mut loads)?,
            AssignStrategy::ZoneAware(policy) => algorithm::assign_zone_aware(request, policy, view, &mut loads)?,
        };

        lease.reserve(&positions);
        crate::metrics::record_assignment(self.id(), positions.len());
        debug!(
            collection = %request.collection,
            strategy = self.id(),
            replicas = positions.len(),
            "Computed replica positions"
        );
        Ok(positions)
    }
}
