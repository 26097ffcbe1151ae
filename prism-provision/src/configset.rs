//! Config sets and config-set resolution for new collections
//!
//! A config set is a named bundle of files under `/configs/<name>`, one child
//! node per file.

use crate::error::{ProvisionError, Result};
use crate::store::{ensure_path, paths, CreateMode, DistributedStore, StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the built-in config set
pub const DEFAULT_CONFIGSET: &str = "_default";

/// Suffix of config sets copied from `_default` for a single collection
pub const AUTOCREATED_SUFFIX: &str = ".AUTOCREATED";

/// Name of the system collection
pub const SYSTEM_COLLECTION: &str = ".system";

/// Warning returned when a collection ends up on the built-in config set
pub const DEFAULT_CONFIGSET_WARNING: &str = "Using _default configset. Data driven schema functionality is enabled by default, which is NOT RECOMMENDED for production use. To turn it off: curl http://{host:port}/prism/{collection}/config -d '{\"set-user-property\": {\"update.autoCreateFields\":\"false\"}}'";

/// Access to stored config sets
#[async_trait]
pub trait ConfigSetService: Send + Sync {
    async fn exists(&self, name: &str) -> StoreResult<bool>;

    /// Copy every file of `source` into a new config set `target`
    async fn copy(&self, source: &str, target: &str) -> StoreResult<()>;

    async fn list(&self) -> StoreResult<Vec<String>>;
}

/// [`ConfigSetService`] backed by `/configs` in the store
pub struct StoreConfigSets {
    store: Arc<dyn DistributedStore>,
}

impl StoreConfigSets {
    pub fn new(store: Arc<dyn DistributedStore>) -> Self {
        Self { store }
    }

    /// Create or replace a config set from file contents
    pub async fn upload(&self, name: &str, files: &BTreeMap<String, Vec<u8>>) -> StoreResult<()> {
        let root = paths::config_set(name);
        ensure_path(self.store.as_ref(), &root).await?;
        for (file, data) in files {
            let path = format!("{}/{}", root, file);
            match self.store.create(&path, data.clone(), CreateMode::Persistent).await {
                Ok(_) => {}
                Err(StoreError::NodeExists(_)) => {
                    self.store.set(&path, data.clone(), None).await?;
                }
                Err(e) => return Err(e),
            }
        }
        info!(config_set = %name, files = files.len(), "Uploaded config set");
        Ok(())
    }

    /// Files of a config set
    pub async fn files(&self, name: &str) -> StoreResult<BTreeMap<String, Vec<u8>>> {
        let root = paths::config_set(name);
        let mut files = BTreeMap::new();
        for file in self.store.children(&root).await? {
            if let Some(node) = self.store.get(&format!("{}/{}", root, file)).await? {
                files.insert(file, node.data);
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl ConfigSetService for StoreConfigSets {
    async fn exists(&self, name: &str) -> StoreResult<bool> {
        self.store.exists(&paths::config_set(name)).await
    }

    async fn copy(&self, source: &str, target: &str) -> StoreResult<()> {
        let files = self.files(source).await?;
        self.store
            .make_path(&paths::config_set(target), Vec::new(), CreateMode::Persistent)
            .await?;
        for (file, data) in files {
            self.store
                .create(&format!("{}/{}", paths::config_set(target), file), data, CreateMode::Persistent)
                .await?;
        }
        debug!(source = %source, target = %target, "Copied config set");
        Ok(())
    }

    async fn list(&self) -> StoreResult<Vec<String>> {
        match self.store.children(paths::CONFIGS).await {
            Ok(names) => Ok(names),
            Err(StoreError::NoNode(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

/// Config set a collection gets when the request does not name one
pub fn autocreated_name(collection: &str) -> String {
    format!("{}{}", collection, AUTOCREATED_SUFFIX)
}

/// Decide which config set a new collection uses.
///
/// An explicit name must exist. Without one, the `_default` set is copied to
/// `<collection>.AUTOCREATED` (an existing copy is reused), the system
/// collection uses the set named after itself, and a cluster with a single
/// config set uses that one.
pub async fn resolve_config_name(
    service: &dyn ConfigSetService,
    collection: &str,
    requested: Option<&str>,
) -> Result<String> {
    if let Some(name) = requested.filter(|n| !n.is_empty()) {
        if !service.exists(name).await? {
            return Err(ProvisionError::ConfigNotFound(format!(
                "Can not find the specified config set: {}",
                name
            )));
        }
        return Ok(name.to_string());
    }

    let available = service.list().await?;
    if available.iter().any(|n| n == DEFAULT_CONFIGSET) {
        if collection == SYSTEM_COLLECTION {
            if !service.exists(collection).await? {
                return Err(ProvisionError::ConfigNotFound(format!(
                    "Can not find the specified config set: {}",
                    collection
                )));
            }
            return Ok(collection.to_string());
        }
        let target = autocreated_name(collection);
        if !service.exists(&target).await? {
            service.copy(DEFAULT_CONFIGSET, &target).await?;
            info!(collection = %collection, config_set = %target, "Created config set from _default");
        }
        return Ok(target);
    }

    if available.len() == 1 {
        return Ok(available[0].clone());
    }

    Err(ProvisionError::ConfigNotFound(
        "No config set found to associate with the collection.".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn files() -> BTreeMap<String, Vec<u8>> {
        let mut files = BTreeMap::new();
        files.insert("schema.json".to_string(), b"{}".to_vec());
        files.insert("settings.json".to_string(), b"{\"a\":1}".to_vec());
        files
    }

    async fn service_with(sets: &[&str]) -> StoreConfigSets {
        let service = StoreConfigSets::new(Arc::new(MemoryStore::new()));
        for set in sets {
            service.upload(set, &files()).await.unwrap();
        }
        service
    }

    #[tokio::test]
    async fn test_explicit_config_must_exist() {
        let service = service_with(&["conf1"]).await;
        assert_eq!(resolve_config_name(&service, "foo", Some("conf1")).await.unwrap(), "conf1");
        let err = resolve_config_name(&service, "foo", Some("missing")).await.unwrap_err();
        assert!(matches!(err, ProvisionError::ConfigNotFound(_)));
    }

    #[tokio::test]
    async fn test_default_is_copied_once() {
        let service = service_with(&["_default", "conf1"]).await;
        let name = resolve_config_name(&service, "foo", None).await.unwrap();
        assert_eq!(name, "foo.AUTOCREATED");
        assert_eq!(service.files("foo.AUTOCREATED").await.unwrap(), files());

        // Second resolution reuses the copy
        let again = resolve_config_name(&service, "foo", None).await.unwrap();
        assert_eq!(again, "foo.AUTOCREATED");
    }

    #[tokio::test]
    async fn test_system_collection_uses_own_name() {
        let service = service_with(&["_default", ".system"]).await;
        let name = resolve_config_name(&service, SYSTEM_COLLECTION, None).await.unwrap();
        assert_eq!(name, ".system");
        assert!(!service.exists(".system.AUTOCREATED").await.unwrap());

        let without = service_with(&["_default"]).await;
        assert!(resolve_config_name(&without, SYSTEM_COLLECTION, None).await.is_err());
    }

    #[tokio::test]
    async fn test_single_config_set_is_used() {
        let service = service_with(&["only"]).await;
        assert_eq!(resolve_config_name(&service, "foo", None).await.unwrap(), "only");
    }

    #[tokio::test]
    async fn test_ambiguous_or_missing() {
        let service = service_with(&["a", "b"]).await;
        let err = resolve_config_name(&service, "foo", None).await.unwrap_err();
        assert_eq!(err.to_string(), "No config set found to associate with the collection.");

        let empty = service_with(&[]).await;
        assert!(resolve_config_name(&empty, "foo", None).await.is_err());
    }
}
