//! Provisioning observability metrics
//!
//! Everything is exported under the `prism_provision_` prefix through the
//! `metrics` facade; without an installed recorder the calls are no-ops.

use std::time::{Duration, Instant};

pub fn record_collection_created(protocol: &str, replicas: usize, duration: Duration) {
    metrics::counter!(
        "prism_provision_collections_created_total",
        "protocol" => protocol.to_string(),
    )
    .increment(1);

    metrics::histogram!(
        "prism_provision_create_duration_seconds",
        "protocol" => protocol.to_string(),
    )
    .record(duration.as_secs_f64());

    metrics::histogram!("prism_provision_replicas_per_collection").record(replicas as f64);
}

pub fn record_command_failed(command: &str, error_type: &str) {
    metrics::counter!(
        "prism_provision_command_failures_total",
        "command" => command.to_string(),
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// `reason` is the error type that triggered the rollback
pub fn record_rollback(reason: &str) {
    metrics::counter!(
        "prism_provision_rollbacks_total",
        "reason" => reason.to_string(),
    )
    .increment(1);
}

/// One placement run and how many replicas it placed
pub fn record_assignment(strategy: &str, replicas: usize) {
    metrics::counter!(
        "prism_provision_assignments_total",
        "strategy" => strategy.to_string(),
    )
    .increment(1);

    metrics::counter!(
        "prism_provision_assigned_replicas_total",
        "strategy" => strategy.to_string(),
    )
    .increment(replicas as u64);
}

pub fn update_active_leases(active: usize) {
    metrics::gauge!("prism_provision_placement_leases_active").set(active as f64);
}

/// Record a state mutation applied by the overseer
pub fn record_state_mutation(kind: &str, outcome: &str) {
    metrics::counter!(
        "prism_provision_state_mutations_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string(),
    )
    .increment(1);
}

pub fn update_queue_depth(depth: usize) {
    metrics::gauge!("prism_provision_state_queue_depth").set(depth as f64);
}

/// Record a lost conditional write on a collection record
pub fn record_cas_conflict() {
    metrics::counter!("prism_provision_cas_conflicts_total").increment(1);
}

/// End of a core-admin call being timed
enum CallSide {
    Client { node: String },
    Handler,
}

struct CallTimer {
    side: CallSide,
    method: &'static str,
    start: Instant,
}

impl CallTimer {
    fn finish(self, error_type: Option<&str>) {
        let seconds = self.start.elapsed().as_secs_f64();
        let status = if error_type.is_some() { "error" } else { "ok" };
        match &self.side {
            CallSide::Client { node } => {
                metrics::histogram!(
                    "prism_provision_core_admin_call_seconds",
                    "method" => self.method,
                    "node" => node.clone(),
                )
                .record(seconds);
                metrics::counter!(
                    "prism_provision_core_admin_calls_total",
                    "method" => self.method,
                    "node" => node.clone(),
                    "status" => status,
                )
                .increment(1);
            }
            CallSide::Handler => {
                metrics::histogram!("prism_provision_core_admin_handled_seconds", "method" => self.method)
                    .record(seconds);
                metrics::counter!(
                    "prism_provision_core_admin_handled_total",
                    "method" => self.method,
                    "status" => status,
                )
                .increment(1);
            }
        }
        if let Some(error_type) = error_type {
            metrics::counter!(
                "prism_provision_core_admin_errors_total",
                "method" => self.method,
                "error_type" => error_type.to_string(),
            )
            .increment(1);
        }
    }
}

/// Times one outgoing core-admin call; consumed by `success` or `error`
pub struct RpcTimer(CallTimer);

impl RpcTimer {
    pub fn new(method: &'static str, node: &str) -> Self {
        Self(CallTimer {
            side: CallSide::Client { node: node.to_string() },
            method,
            start: Instant::now(),
        })
    }

    pub fn success(self) {
        self.0.finish(None);
    }

    pub fn error(self, error_type: &str) {
        self.0.finish(Some(error_type));
    }
}

/// Times one core-admin call served by a node
pub struct RpcHandlerTimer(CallTimer);

impl RpcHandlerTimer {
    pub fn new(method: &'static str) -> Self {
        Self(CallTimer {
            side: CallSide::Handler,
            method,
            start: Instant::now(),
        })
    }

    pub fn success(self) {
        self.0.finish(None);
    }

    pub fn error(self, error_type: &str) {
        self.0.finish(Some(error_type));
    }
}
