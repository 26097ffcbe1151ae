//! Command input and output for collection creation

use crate::error::{ProvisionError, Result};
use crate::planner::ReplicaCounts;
use crate::types::Router;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

/// Parameters prefixed with this are stored on the collection metadata node
pub const COLLECTION_PARAM_PREFIX: &str = "collection.";

/// Parameters prefixed with this are passed to every created core
pub const CORE_PROPERTY_PREFIX: &str = "property.";

/// A request to create a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCollectionRequest {
    pub name: String,

    /// Alias to register for the new collection; equal to `name` is a no-op
    pub alias: Option<String>,

    pub router: Router,

    /// Comma-separated shard names (implicit router)
    pub shards: Option<String>,

    /// Shard count (compositeId router)
    pub num_shards: Option<i64>,

    pub nrt_replicas: Option<u32>,
    pub tlog_replicas: Option<u32>,
    pub pull_replicas: Option<u32>,
    pub replication_factor: Option<u32>,

    /// Positive limit or -1 for unbounded
    pub max_shards_per_node: i32,

    pub config_name: Option<String>,

    /// Companion collection whose replicas must be present on every node we use
    pub with_collection: Option<String>,

    pub wait_for_final_state: bool,

    /// Use the direct conditional-write protocol with per-replica state records
    pub per_replica_state: bool,

    /// Correlation id for asynchronous status polling
    pub async_id: Option<String>,

    /// `collection.*` parameters, prefix stripped
    pub collection_params: BTreeMap<String, String>,

    /// `property.*` parameters, prefix stripped
    pub core_properties: BTreeMap<String, String>,
}

impl CreateCollectionRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            router: Router::CompositeId,
            shards: None,
            num_shards: None,
            nrt_replicas: None,
            tlog_replicas: None,
            pull_replicas: None,
            replication_factor: None,
            max_shards_per_node: 1,
            config_name: None,
            with_collection: None,
            wait_for_final_state: false,
            per_replica_state: false,
            async_id: None,
            collection_params: BTreeMap::new(),
            core_properties: BTreeMap::new(),
        }
    }

    pub fn with_num_shards(mut self, num_shards: i64) -> Self {
        self.router = Router::CompositeId;
        self.num_shards = Some(num_shards);
        self
    }

    /// Use the implicit router with the given comma-separated shard names
    pub fn with_shards(mut self, shards: impl Into<String>) -> Self {
        self.router = Router::Implicit;
        self.shards = Some(shards.into());
        self
    }

    pub fn with_replicas(mut self, nrt: u32, tlog: u32, pull: u32) -> Self {
        self.nrt_replicas = Some(nrt);
        self.tlog_replicas = Some(tlog);
        self.pull_replicas = Some(pull);
        self
    }

    pub fn with_max_shards_per_node(mut self, max: i32) -> Self {
        self.max_shards_per_node = max;
        self
    }

    pub fn with_config(mut self, config_name: impl Into<String>) -> Self {
        self.config_name = Some(config_name.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_collection(mut self, companion: impl Into<String>) -> Self {
        self.with_collection = Some(companion.into());
        self
    }

    pub fn with_per_replica_state(mut self, enabled: bool) -> Self {
        self.per_replica_state = enabled;
        self
    }

    pub fn with_async_id(mut self, async_id: impl Into<String>) -> Self {
        self.async_id = Some(async_id.into());
        self
    }

    /// Build a request from flat key/value command parameters
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self> {
        let name = params
            .get("name")
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| ProvisionError::InvalidRequest("missing required parameter: name".to_string()))?;
        let mut request = Self::new(name.trim());

        request.alias = non_empty(params, "alias");
        if let Some(router) = non_empty(params, "router.name") {
            request.router = Router::from_str(&router).map_err(ProvisionError::InvalidRequest)?;
        }
        request.shards = non_empty(params, "shards");
        request.num_shards = parse_param(params, "numShards")?;
        request.nrt_replicas = parse_param(params, "nrtReplicas")?;
        request.tlog_replicas = parse_param(params, "tlogReplicas")?;
        request.pull_replicas = parse_param(params, "pullReplicas")?;
        request.replication_factor = parse_param(params, "replicationFactor")?;
        if let Some(max) = parse_param(params, "maxShardsPerNode")? {
            request.max_shards_per_node = max;
        }
        request.config_name = non_empty(params, "collection.configName").or_else(|| non_empty(params, "config"));
        request.with_collection = non_empty(params, "withCollection");
        request.wait_for_final_state = parse_param(params, "waitForFinalState")?.unwrap_or(false);
        request.per_replica_state = parse_param(params, "perReplicaState")?.unwrap_or(false);
        request.async_id = non_empty(params, "async");

        for (key, value) in params {
            if let Some(param) = key.strip_prefix(COLLECTION_PARAM_PREFIX) {
                if param != "configName" {
                    request.collection_params.insert(param.to_string(), value.clone());
                }
            } else if let Some(property) = key.strip_prefix(CORE_PROPERTY_PREFIX) {
                request.core_properties.insert(property.to_string(), value.clone());
            }
        }

        Ok(request)
    }

    /// Resolved replica counts per shard
    pub fn replica_counts(&self) -> ReplicaCounts {
        ReplicaCounts::resolve(
            self.nrt_replicas,
            self.tlog_replicas,
            self.pull_replicas,
            self.replication_factor,
        )
    }
}

fn non_empty(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_param<T: FromStr>(params: &HashMap<String, String>, key: &str) -> Result<Option<T>> {
    match non_empty(params, key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ProvisionError::InvalidRequest(format!("invalid value for {}: {}", key, raw))),
        None => Ok(None),
    }
}

/// Acknowledgement of one dispatched core creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreAck {
    pub core: String,
    pub replica_name: Option<String>,
    pub async_id: Option<String>,
}

/// Result of a successful collection creation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCollectionResponse {
    /// Dispatch acknowledgements per node
    pub success: BTreeMap<String, Vec<CoreAck>>,

    pub warnings: Vec<String>,

    pub async_id: Option<String>,
}

impl CreateCollectionResponse {
    pub fn core_count(&self) -> usize {
        self.success.values().map(|acks| acks.len()).sum()
    }
}
