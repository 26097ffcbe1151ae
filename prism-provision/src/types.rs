//! Cluster topology types
//!
//! These are the records stored in the distributed store: collections with
//! their shards and replicas, and the properties each live node publishes.
//! They are plain serde types so they round-trip through both JSON records
//! and bincode queue messages.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Prefix for replica names inside a collection
pub const REPLICA_NAME_PREFIX: &str = "core_node";

/// Kind of replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplicaType {
    /// Near-real-time: indexes locally, can become leader
    Nrt,
    /// Transaction log only, can become leader
    Tlog,
    /// Pulls index segments from the leader, never leader
    Pull,
}

impl ReplicaType {
    /// Placement order: NRT first, then TLOG, then PULL
    pub const ALL: [ReplicaType; 3] = [ReplicaType::Nrt, ReplicaType::Tlog, ReplicaType::Pull];

    /// Letter used in core names (`_replica_n1`, `_replica_t2`, ...)
    pub fn suffix_char(&self) -> char {
        match self {
            ReplicaType::Nrt => 'n',
            ReplicaType::Tlog => 't',
            ReplicaType::Pull => 'p',
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaType::Nrt => "NRT",
            ReplicaType::Tlog => "TLOG",
            ReplicaType::Pull => "PULL",
        }
    }

    pub fn is_leader_eligible(&self) -> bool {
        !matches!(self, ReplicaType::Pull)
    }
}

impl fmt::Display for ReplicaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplicaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NRT" => Ok(ReplicaType::Nrt),
            "TLOG" => Ok(ReplicaType::Tlog),
            "PULL" => Ok(ReplicaType::Pull),
            other => Err(format!("unknown replica type: {}", other)),
        }
    }
}

/// Lifecycle state of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaState {
    /// Registered but not serving
    #[default]
    Down,
    /// Catching up from the leader
    Recovering,
    /// Serving requests
    Active,
    /// Gave up; needs operator attention
    Failed,
}

impl ReplicaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaState::Down => "down",
            ReplicaState::Recovering => "recovering",
            ReplicaState::Active => "active",
            ReplicaState::Failed => "failed",
        }
    }
}

/// State of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShardState {
    #[default]
    Active,
    /// Being built by a split, not yet routable
    Construction,
    /// Retired after a split
    Inactive,
}

/// Document routing scheme of a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Router {
    /// Shards are named explicitly; documents name their shard
    #[serde(rename = "implicit")]
    Implicit,
    /// Shards own contiguous ranges of the 32-bit hash space
    #[default]
    #[serde(rename = "compositeId")]
    CompositeId,
}

impl Router {
    pub fn as_str(&self) -> &'static str {
        match self {
            Router::Implicit => "implicit",
            Router::CompositeId => "compositeId",
        }
    }
}

impl FromStr for Router {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "implicit" => Ok(Router::Implicit),
            "compositeId" | "compositeid" => Ok(Router::CompositeId),
            other => Err(format!("unknown router: {}", other)),
        }
    }
}

/// Inclusive range of the signed 32-bit hash space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRange {
    pub min: i32,
    pub max: i32,
}

impl HashRange {
    /// Split the full hash space into `partitions` contiguous ranges.
    ///
    /// Returns an empty vector for zero partitions.
    pub fn partition(partitions: usize) -> Vec<HashRange> {
        if partitions == 0 {
            return Vec::new();
        }
        let span: i64 = (i32::MAX as i64) - (i32::MIN as i64) + 1;
        let n = partitions as i64;
        (0..n)
            .map(|i| HashRange {
                min: (i32::MIN as i64 + span * i / n) as i32,
                max: (i32::MIN as i64 + span * (i + 1) / n - 1) as i32,
            })
            .collect()
    }

    pub fn contains(&self, hash: i32) -> bool {
        self.min <= hash && hash <= self.max
    }
}

impl fmt::Display for HashRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}-{:08x}", self.min as u32, self.max as u32)
    }
}

/// One copy of a shard hosted by a core on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    /// Replica name, unique within the collection (`core_node<N>`)
    pub name: String,

    /// Core name on the hosting node
    pub core: String,

    /// Shard this replica belongs to
    pub shard: String,

    /// Hosting node
    pub node_name: String,

    /// Base URL of the hosting node
    pub base_url: String,

    #[serde(rename = "type")]
    pub replica_type: ReplicaType,

    pub state: ReplicaState,
}

/// A logical partition of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub name: String,

    /// Hash range for hash-routed collections
    #[serde(default)]
    pub range: Option<HashRange>,

    #[serde(default)]
    pub state: ShardState,

    /// Replicas keyed by replica name
    #[serde(default)]
    pub replicas: BTreeMap<String, Replica>,
}

impl Shard {
    pub fn new(name: impl Into<String>, range: Option<HashRange>) -> Self {
        Self {
            name: name.into(),
            range,
            state: ShardState::Active,
            replicas: BTreeMap::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ShardState::Active
    }

    /// True when every replica reports ACTIVE
    pub fn all_replicas_active(&self) -> bool {
        self.replicas.values().all(|r| r.state == ReplicaState::Active)
    }
}

/// A named, sharded, replicated index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,

    #[serde(default)]
    pub router: Router,

    /// Shards in creation order
    #[serde(default)]
    pub shards: Vec<Shard>,

    pub config_name: String,

    /// Replica states live in per-replica records and the collection record
    /// is written with conditional sets instead of through the queue
    #[serde(default)]
    pub per_replica_state: bool,

    /// Maximum replicas of this collection on one node, -1 for unbounded
    #[serde(default = "default_max_shards_per_node")]
    pub max_shards_per_node: i32,

    #[serde(default)]
    pub nrt_replicas: u32,

    #[serde(default)]
    pub tlog_replicas: u32,

    #[serde(default)]
    pub pull_replicas: u32,

    /// Collection that was created with this one as its companion
    #[serde(default)]
    pub colocated_with: Option<String>,

    /// Companion collection whose replicas must sit next to ours
    #[serde(default)]
    pub with_collection: Option<String>,

    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_max_shards_per_node() -> i32 {
    1
}

impl Collection {
    pub fn shard(&self, name: &str) -> Option<&Shard> {
        self.shards.iter().find(|s| s.name == name)
    }

    pub fn shard_mut(&mut self, name: &str) -> Option<&mut Shard> {
        self.shards.iter_mut().find(|s| s.name == name)
    }

    pub fn active_shards(&self) -> Vec<&Shard> {
        self.shards.iter().filter(|s| s.is_active()).collect()
    }

    /// All replicas across all shards
    pub fn replicas(&self) -> impl Iterator<Item = &Replica> {
        self.shards.iter().flat_map(|s| s.replicas.values())
    }

    pub fn replica_count(&self) -> usize {
        self.shards.iter().map(|s| s.replicas.len()).sum()
    }

    pub fn replicas_on_node<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Replica> + 'a {
        self.replicas().filter(move |r| r.node_name == node)
    }

    pub fn replica_by_core(&self, core: &str) -> Option<&Replica> {
        self.replicas().find(|r| r.core == core)
    }

    pub fn replica_by_name(&self, name: &str) -> Option<&Replica> {
        self.replicas().find(|r| r.name == name)
    }

    /// Number of replicas of this collection per node
    pub fn replicas_per_node(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for replica in self.replicas() {
            *counts.entry(replica.node_name.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Next free `core_node<N>` name
    pub fn next_replica_name(&self) -> String {
        let max = self
            .replicas()
            .filter_map(|r| r.name.strip_prefix(REPLICA_NAME_PREFIX))
            .filter_map(|n| n.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        format!("{}{}", REPLICA_NAME_PREFIX, max + 1)
    }

    pub fn all_replicas_active(&self) -> bool {
        self.shards.iter().all(|s| s.all_replicas_active())
    }
}

/// Properties a live node publishes about itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProperties {
    /// Base URL for core-admin calls; derived from the node name when empty
    #[serde(default)]
    pub base_url: Option<String>,

    /// Availability zone (e.g., "us-east-1a")
    #[serde(default)]
    pub zone: Option<String>,

    /// Rack identifier within the zone
    #[serde(default)]
    pub rack: Option<String>,

    /// Region (e.g., "us-east-1")
    #[serde(default)]
    pub region: Option<String>,

    /// Custom attributes for placement rules
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl NodeProperties {
    pub fn with_zone(zone: impl Into<String>) -> Self {
        Self {
            zone: Some(zone.into()),
            ..Default::default()
        }
    }

    /// Get an attribute value by key
    pub fn get_attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }

    /// Get disk type attribute if set
    pub fn disk_type(&self) -> Option<&str> {
        self.get_attribute("disk_type")
    }

    pub fn has_ssd(&self) -> bool {
        self.disk_type() == Some("ssd")
    }
}

/// Derive a base URL from a node name of the form `host:port_context`
pub fn base_url_for_node(node_name: &str) -> String {
    match node_name.split_once('_') {
        Some((host, context)) => format!("http://{}/{}", host, context),
        None => format!("http://{}", node_name),
    }
}
