//! Fan-out of core creations for one command run
//!
//! All requests go out at once and are awaited together under one batch
//! deadline. Requests sent with an async id are acknowledged immediately by
//! the node; their outcome is then polled through `request_status` until it
//! is terminal or the same deadline passes. Nothing is retried here: a failed
//! call is reported and the caller decides what to do.

use crate::error::NodeFailure;
use crate::request::CoreAck;
use crate::rpc::{AsyncStatus, CoreAdmin, CreateCoreRequest};
use crate::store::{paths, read_json, write_json, DistributedStore, StoreResult};
use crate::wait::{poll_until, PollConfig};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A core creation addressed to a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRequest {
    pub node: String,
    pub request: CreateCoreRequest,
}

/// Aggregated outcome of a batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardResponses {
    pub success: Vec<(String, CoreAck)>,
    pub failures: Vec<NodeFailure>,
}

impl ShardResponses {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Acknowledgements grouped by node
    pub fn success_by_node(&self) -> BTreeMap<String, Vec<CoreAck>> {
        let mut by_node: BTreeMap<String, Vec<CoreAck>> = BTreeMap::new();
        for (node, ack) in &self.success {
            by_node.entry(node.clone()).or_default().push(ack.clone());
        }
        by_node
    }
}

/// Outcome stored for a caller-supplied async id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncOutcome {
    pub success: BTreeMap<String, Vec<CoreAck>>,
    pub failures: Vec<NodeFailure>,
    /// Set when the command failed
    pub error: Option<String>,
}

impl AsyncOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failures.is_empty()
    }
}

pub struct ShardRequestTracker {
    core_admin: Arc<dyn CoreAdmin>,
    async_prefix: Option<String>,
    seq: AtomicU64,
    timeout: Duration,
    poll_interval: Duration,
}

impl ShardRequestTracker {
    pub fn new(
        core_admin: Arc<dyn CoreAdmin>,
        async_prefix: Option<String>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            core_admin,
            async_prefix,
            seq: AtomicU64::new(0),
            timeout,
            poll_interval,
        }
    }

    /// Per-core async id `<prefix><seq>`, `None` for synchronous runs
    pub fn next_async_id(&self) -> Option<String> {
        self.async_prefix
            .as_ref()
            .map(|prefix| format!("{}{}", prefix, self.seq.fetch_add(1, Ordering::SeqCst) + 1))
    }

    /// Submit every request concurrently and wait for all of them
    pub async fn submit_all(&self, requests: Vec<ShardRequest>) -> ShardResponses {
        let deadline = Instant::now() + self.timeout;
        debug!(requests = requests.len(), timeout_ms = self.timeout.as_millis() as u64, "Submitting core creations");

        let calls = requests.iter().map(|r| async move {
            let result = tokio::time::timeout_at(deadline, self.core_admin.create_core(&r.node, r.request.clone())).await;
            (r, result)
        });

        let mut responses = ShardResponses::default();
        let mut pending = Vec::new();
        for (r, result) in join_all(calls).await {
            match result {
                Ok(Ok(ack)) => match ack.async_id {
                    Some(async_id) => pending.push((r, async_id)),
                    None => responses.success.push((r.node.clone(), ack_for(r, None))),
                },
                Ok(Err(e)) => {
                    warn!(node = %r.node, core = %r.request.core, error = %e, "Core creation failed");
                    responses.failures.push(NodeFailure::new(&r.node, &r.request.core, e.to_string()));
                }
                Err(_) => {
                    warn!(node = %r.node, core = %r.request.core, "Core creation timed out");
                    responses.failures.push(NodeFailure::new(
                        &r.node,
                        &r.request.core,
                        format!("no response within {}ms", self.timeout.as_millis()),
                    ));
                }
            }
        }

        let polls = pending.into_iter().map(|(r, async_id)| async move {
            let status = self.wait_for_async(&r.node, &async_id, deadline).await;
            (r, async_id, status)
        });
        for (r, async_id, status) in join_all(polls).await {
            match status {
                AsyncStatus::Completed => responses.success.push((r.node.clone(), ack_for(r, Some(async_id)))),
                AsyncStatus::Failed(message) => {
                    responses.failures.push(NodeFailure::new(&r.node, &r.request.core, message));
                }
                other => {
                    responses.failures.push(NodeFailure::new(
                        &r.node,
                        &r.request.core,
                        format!("async request {} ended as {:?}", async_id, other),
                    ));
                }
            }
        }

        debug!(
            succeeded = responses.success.len(),
            failed = responses.failures.len(),
            "Core creations finished"
        );
        responses
    }

    async fn wait_for_async(&self, node: &str, async_id: &str, deadline: Instant) -> AsyncStatus {
        let poll = PollConfig::new(deadline.saturating_duration_since(Instant::now()), self.poll_interval);
        let core_admin = &self.core_admin;
        let result = poll_until(poll, move || async move {
            let status = core_admin.request_status(node, async_id).await?;
            Ok::<_, crate::error::RpcError>(status.is_terminal().then_some(status))
        })
        .await;

        match result {
            Ok(Some(status)) => status,
            Ok(None) => AsyncStatus::Failed(format!("async request {} did not complete in time", async_id)),
            Err(e) => AsyncStatus::Failed(e.to_string()),
        }
    }
}

fn ack_for(request: &ShardRequest, async_id: Option<String>) -> CoreAck {
    CoreAck {
        core: request.request.core.clone(),
        replica_name: request.request.replica_name.clone(),
        async_id,
    }
}

/// Store the outcome of a command run under its async id
pub async fn record_outcome(store: &dyn DistributedStore, async_id: &str, outcome: &AsyncOutcome) -> StoreResult<()> {
    write_json(store, &paths::async_id(async_id), outcome).await
}

/// Outcome of an earlier asynchronous command run
pub async fn fetch_async_outcome(store: &dyn DistributedStore, async_id: &str) -> StoreResult<Option<AsyncOutcome>> {
    Ok(read_json(store, &paths::async_id(async_id)).await?.map(|(outcome, _)| outcome))
}
