//! Collection aliases stored in `/aliases.json`

use crate::store::{paths, CreateMode, DistributedStore, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Alias name to the collections it points at
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aliases {
    #[serde(default, rename = "collection")]
    collection_aliases: BTreeMap<String, Vec<String>>,
}

impl Aliases {
    /// Read aliases and the record version (`None` when no record exists yet)
    pub async fn load(store: &dyn DistributedStore) -> StoreResult<(Aliases, Option<i32>)> {
        match store.get(paths::ALIASES).await? {
            Some(node) if node.data.is_empty() => Ok((Aliases::default(), Some(node.version))),
            Some(node) => Ok((serde_json::from_slice(&node.data)?, Some(node.version))),
            None => Ok((Aliases::default(), None)),
        }
    }

    pub fn has_alias(&self, name: &str) -> bool {
        self.collection_aliases.contains_key(name)
    }

    pub fn collections_for(&self, alias: &str) -> Option<&[String]> {
        self.collection_aliases.get(alias).map(|v| v.as_slice())
    }

    /// Follow an alias that points at exactly one collection, otherwise return `name`
    pub fn resolve_simple_alias<'a>(&'a self, name: &'a str) -> &'a str {
        match self.collection_aliases.get(name) {
            Some(targets) if targets.len() == 1 => targets[0].as_str(),
            _ => name,
        }
    }

    /// Copy of these aliases with `alias` pointing at `collections`
    pub fn with_collection_alias(&self, alias: &str, collections: Vec<String>) -> Aliases {
        let mut next = self.clone();
        next.collection_aliases.insert(alias.to_string(), collections);
        next
    }

    pub fn is_empty(&self) -> bool {
        self.collection_aliases.is_empty()
    }
}

/// Conditional updates of the alias record
pub struct AliasManager {
    store: Arc<dyn DistributedStore>,
    max_retries: usize,
}

impl AliasManager {
    pub fn new(store: Arc<dyn DistributedStore>, max_retries: usize) -> Self {
        Self { store, max_retries }
    }

    /// Point `alias` at `collection`, retrying on concurrent alias updates
    pub async fn add_collection_alias(&self, alias: &str, collection: &str) -> StoreResult<()> {
        for attempt in 0..self.max_retries.max(1) {
            let (current, version) = Aliases::load(self.store.as_ref()).await?;
            let next = current.with_collection_alias(alias, vec![collection.to_string()]);
            let data = serde_json::to_vec(&next)?;

            let written = match version {
                Some(version) => self.store.set(paths::ALIASES, data, Some(version)).await.map(|_| ()),
                None => self
                    .store
                    .create(paths::ALIASES, data, CreateMode::Persistent)
                    .await
                    .map(|_| ()),
            };
            match written {
                Ok(()) => {
                    info!(alias = %alias, collection = %collection, "Created collection alias");
                    return Ok(());
                }
                Err(StoreError::BadVersion { .. }) | Err(StoreError::NodeExists(_)) => {
                    debug!(alias = %alias, attempt, "Alias record changed concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Backend(format!(
            "gave up updating aliases after {} attempts",
            self.max_retries
        )))
    }
}
