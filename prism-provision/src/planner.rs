//! Topology planning: shard names and replica counts

use crate::error::{ProvisionError, Result};
use crate::types::{HashRange, ReplicaType, Router, Shard};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Prefix of generated shard names
pub const SHARD_NAME_PREFIX: &str = "shard";

/// Sentinel for an unbounded `maxShardsPerNode`
pub const UNBOUNDED_SHARDS_PER_NODE: i32 = -1;

/// Requested number of replicas of each type per shard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaCounts {
    pub nrt: u32,
    pub tlog: u32,
    pub pull: u32,
}

impl ReplicaCounts {
    pub fn new(nrt: u32, tlog: u32, pull: u32) -> Self {
        Self { nrt, tlog, pull }
    }

    /// Apply the defaulting rules: NRT falls back to `replication_factor`,
    /// then to 0 when TLOG replicas were requested, then to 1.
    pub fn resolve(
        nrt: Option<u32>,
        tlog: Option<u32>,
        pull: Option<u32>,
        replication_factor: Option<u32>,
    ) -> Self {
        let tlog = tlog.unwrap_or(0);
        let pull = pull.unwrap_or(0);
        let nrt = nrt
            .or(replication_factor)
            .unwrap_or(if tlog > 0 { 0 } else { 1 });
        Self { nrt, tlog, pull }
    }

    pub fn total(&self) -> u32 {
        self.nrt + self.tlog + self.pull
    }

    pub fn get(&self, replica_type: ReplicaType) -> u32 {
        match replica_type {
            ReplicaType::Nrt => self.nrt,
            ReplicaType::Tlog => self.tlog,
            ReplicaType::Pull => self.pull,
        }
    }

    /// Counts in placement order (NRT, TLOG, PULL)
    pub fn iter(&self) -> impl Iterator<Item = (ReplicaType, u32)> + '_ {
        ReplicaType::ALL.into_iter().map(move |t| (t, self.get(t)))
    }
}

/// Every shard needs at least one replica that can lead
pub fn check_replica_types(counts: &ReplicaCounts) -> Result<()> {
    if counts.nrt + counts.tlog == 0 {
        return Err(ProvisionError::InvalidRequest(
            "nrtReplicas + tlogReplicas must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

pub fn check_max_shards_per_node(max_shards_per_node: i32) -> Result<()> {
    if max_shards_per_node == 0 || max_shards_per_node < UNBOUNDED_SHARDS_PER_NODE {
        return Err(ProvisionError::InvalidRequest(format!(
            "maxShardsPerNode must be a positive number or {}, got {}",
            UNBOUNDED_SHARDS_PER_NODE, max_shards_per_node
        )));
    }
    Ok(())
}

/// `shard1..shardN`
pub fn shard_names(num_shards: usize) -> Vec<String> {
    (1..=num_shards)
        .map(|i| format!("{}{}", SHARD_NAME_PREFIX, i))
        .collect()
}

/// Parse a comma-separated shard list, trimming and dropping empty entries
pub fn parse_shard_list(shards: &str) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for name in shards.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !seen.insert(name) {
            return Err(ProvisionError::InvalidRequest(format!("duplicate shard name: {}", name)));
        }
        names.push(name.to_string());
    }
    Ok(names)
}

/// Shard names for a new collection
pub fn plan_shards(router: Router, shards: Option<&str>, num_shards: Option<i64>) -> Result<Vec<String>> {
    let names = match router {
        Router::Implicit => {
            let list = shards.ok_or_else(|| {
                ProvisionError::InvalidRequest("shards is a required param (when using implicit router)".to_string())
            })?;
            parse_shard_list(list)?
        }
        Router::CompositeId => {
            let num_shards = num_shards.ok_or_else(|| {
                ProvisionError::InvalidRequest("numShards is a required param (when using CompositeId router).".to_string())
            })?;
            if num_shards <= 0 {
                return Err(ProvisionError::InvalidRequest("numShards must be > 0".to_string()));
            }
            shard_names(num_shards as usize)
        }
    };
    if names.is_empty() {
        return Err(ProvisionError::InvalidRequest("no shards specified".to_string()));
    }
    Ok(names)
}

/// Empty shards for the given names, with hash ranges when hash-routed
pub fn build_shards(router: Router, names: &[String]) -> Vec<Shard> {
    match router {
        Router::Implicit => names.iter().map(|n| Shard::new(n.clone(), None)).collect(),
        Router::CompositeId => names
            .iter()
            .zip(HashRange::partition(names.len()))
            .map(|(n, range)| Shard::new(n.clone(), Some(range)))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nrt_defaults() {
        assert_eq!(ReplicaCounts::resolve(None, None, None, None), ReplicaCounts::new(1, 0, 0));
        assert_eq!(ReplicaCounts::resolve(None, None, None, Some(3)), ReplicaCounts::new(3, 0, 0));
        assert_eq!(ReplicaCounts::resolve(None, Some(2), None, None), ReplicaCounts::new(0, 2, 0));
        assert_eq!(ReplicaCounts::resolve(Some(2), None, Some(1), Some(5)), ReplicaCounts::new(2, 0, 1));
        assert_eq!(ReplicaCounts::new(2, 1, 1).total(), 4);
    }

    #[test]
    fn test_pull_only_is_invalid() {
        let counts = ReplicaCounts::resolve(Some(0), Some(0), Some(2), None);
        let err = check_replica_types(&counts).unwrap_err();
        assert_eq!(err.to_string(), "Invalid request: nrtReplicas + tlogReplicas must be greater than 0");
        assert!(check_replica_types(&ReplicaCounts::new(0, 1, 3)).is_ok());
    }

    #[test]
    fn test_composite_id_shards() {
        assert_eq!(
            plan_shards(Router::CompositeId, None, Some(3)).unwrap(),
            vec!["shard1", "shard2", "shard3"]
        );
        assert!(plan_shards(Router::CompositeId, None, None).is_err());
        assert!(plan_shards(Router::CompositeId, None, Some(0)).is_err());
        assert!(plan_shards(Router::CompositeId, None, Some(-2)).is_err());
    }

    #[test]
    fn test_implicit_shards() {
        assert_eq!(
            plan_shards(Router::Implicit, Some(" s1, s2,,s3 "), None).unwrap(),
            vec!["s1", "s2", "s3"]
        );
        assert!(plan_shards(Router::Implicit, None, Some(2)).is_err());
        assert!(plan_shards(Router::Implicit, Some(" , "), None).is_err());
        assert!(plan_shards(Router::Implicit, Some("a,b,a"), None).is_err());
    }

    #[test]
    fn test_build_shards_ranges() {
        let shards = build_shards(Router::CompositeId, &shard_names(2));
        assert_eq!(shards[0].range.unwrap().to_string(), "80000000-ffffffff");
        assert_eq!(shards[1].range.unwrap().to_string(), "00000000-7fffffff");

        let implicit = build_shards(Router::Implicit, &["a".to_string()]);
        assert!(implicit[0].range.is_none());
        assert!(implicit[0].replicas.is_empty());
    }

    #[test]
    fn test_max_shards_per_node() {
        assert!(check_max_shards_per_node(1).is_ok());
        assert!(check_max_shards_per_node(-1).is_ok());
        assert!(check_max_shards_per_node(0).is_err());
        assert!(check_max_shards_per_node(-5).is_err());
    }
}
