//! Cluster observability metrics
//!
//! Prometheus-compatible metrics for coordination operations:
//! - Lock acquisitions, timeouts and long-held warnings
//! - Affinity RPC duration and errors
//! - Message bus traffic
//! - Task submissions per nesting level
//! - File transfer volume

use std::time::{Duration, Instant};

/// Record a lock acquisition attempt outcome ("acquired", "timeout", "error")
pub fn record_lock_acquire(outcome: &str, wait: Duration) {
    metrics::counter!(
        "cohort_lock_acquire_total",
        "outcome" => outcome.to_string(),
    )
    .increment(1);

    metrics::histogram!("cohort_lock_wait_seconds").record(wait.as_secs_f64());
}

/// Record a retry of a lock operation after a transient failure
pub fn record_lock_retry(operation: &str) {
    metrics::counter!(
        "cohort_lock_retries_total",
        "operation" => operation.to_string(),
    )
    .increment(1);
}

/// Number of locks currently held by this node
pub fn update_locks_held(count: usize) {
    metrics::gauge!("cohort_locks_held").set(count as f64);
}

/// Record locks the watchdog found held past the threshold
pub fn record_long_held_locks(count: usize) {
    metrics::counter!("cohort_lock_long_held_total").increment(count as u64);
}

/// Record RPC call duration
pub fn record_rpc_duration(kind: &str, duration: Duration) {
    metrics::histogram!(
        "cohort_rpc_duration_seconds",
        "kind" => kind.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record RPC call success
pub fn record_rpc_success(kind: &str) {
    metrics::counter!(
        "cohort_rpc_requests_total",
        "kind" => kind.to_string(),
        "status" => "ok",
    )
    .increment(1);
}

/// Record RPC call error
pub fn record_rpc_error(kind: &str, error_type: &str) {
    metrics::counter!(
        "cohort_rpc_requests_total",
        "kind" => kind.to_string(),
        "status" => "error",
    )
    .increment(1);

    metrics::counter!(
        "cohort_rpc_errors_total",
        "kind" => kind.to_string(),
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Number of RPC requests awaiting a reply
pub fn update_rpc_pending(count: usize) {
    metrics::gauge!("cohort_rpc_pending").set(count as f64);
}

/// Record a message published on a topic
pub fn record_message_published(topic: &str) {
    metrics::counter!(
        "cohort_messages_published_total",
        "topic" => topic.to_string(),
    )
    .increment(1);
}

/// Record a message handed to a listener
pub fn record_message_delivered(topic: &str) {
    metrics::counter!(
        "cohort_messages_delivered_total",
        "topic" => topic.to_string(),
    )
    .increment(1);
}

/// Record a task submission at a nesting level
pub fn record_task_submitted(level: u32) {
    metrics::counter!(
        "cohort_tasks_submitted_total",
        "level" => level.to_string(),
    )
    .increment(1);
}

/// Record bytes moved by the transfer service ("sent" or "received")
pub fn record_transfer_bytes(direction: &str, bytes: u64) {
    metrics::counter!(
        "cohort_transfer_bytes_total",
        "direction" => direction.to_string(),
    )
    .increment(bytes);
}

/// Record a failed transfer connection
pub fn record_transfer_error(error_type: &str) {
    metrics::counter!(
        "cohort_transfer_errors_total",
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Current cluster size as seen by this node
pub fn update_member_count(count: usize) {
    metrics::gauge!("cohort_cluster_members").set(count as f64);
}

/// Guard for timing RPC operations
pub struct RpcTimer {
    kind: &'static str,
    start: Instant,
}

impl RpcTimer {
    /// Start timing an RPC operation
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            start: Instant::now(),
        }
    }

    /// Record success and duration
    pub fn success(self) {
        record_rpc_duration(self.kind, self.start.elapsed());
        record_rpc_success(self.kind);
    }

    /// Record error and duration
    pub fn error(self, error_type: &str) {
        record_rpc_duration(self.kind, self.start.elapsed());
        record_rpc_error(self.kind, error_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_timer() {
        let timer = RpcTimer::new("affinity");
        std::thread::sleep(Duration::from_millis(1));
        timer.success();

        let timer = RpcTimer::new("service");
        timer.error("timeout");
    }

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: calls must be no-ops, not panics
        record_lock_acquire("acquired", Duration::from_millis(3));
        record_transfer_bytes("sent", 1024);
        update_member_count(3);
    }
}
