//! Snapshot with one collection replaced by an in-progress version

use super::{ClusterState, ClusterStateView};
use crate::types::{Collection, NodeProperties};
use std::collections::BTreeSet;
use std::sync::Arc;

/// A [`ClusterState`] in which `pending` shadows the stored collection of
/// the same name. Placement runs against this so a collection being created
/// is visible before its record has been published.
pub struct OverlayClusterState {
    base: Arc<ClusterState>,
    pending: Collection,
}

impl OverlayClusterState {
    pub fn new(base: Arc<ClusterState>, pending: Collection) -> Self {
        Self { base, pending }
    }

    pub fn pending(&self) -> &Collection {
        &self.pending
    }
}

impl ClusterStateView for OverlayClusterState {
    fn collection(&self, name: &str) -> Option<&Collection> {
        if name == self.pending.name {
            Some(&self.pending)
        } else {
            self.base.collection(name)
        }
    }

    fn collection_names(&self) -> Vec<String> {
        let mut names = self.base.collection_names();
        if !names.contains(&self.pending.name) {
            names.push(self.pending.name.clone());
        }
        names
    }

    fn live_nodes(&self) -> &BTreeSet<String> {
        self.base.live_nodes()
    }

    fn node_properties(&self, node: &str) -> Option<&NodeProperties> {
        self.base.node_properties(node)
    }
}
