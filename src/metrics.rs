//! Metrics instrumentation for ddnssd.
//!
//! All metrics are prefixed with `ddnssd.`

use metrics::{counter, gauge, histogram};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Record the daemon start time, labelled with the build's git revision
/// (from `DDNSSD_GIT_REVISION`, empty when unset).
pub fn record_start_timestamp() {
    let revision = std::env::var("DDNSSD_GIT_REVISION").unwrap_or_default();
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    gauge!("ddnssd_start_timestamp", "git_revision" => revision).set(now);
}

/// Record a processed queue event.
pub fn record_event(kind: &'static str) {
    counter!("ddnssd.event.count", "type" => kind).increment(1);
}

/// Record an event that was dropped instead of processed.
pub fn record_event_dropped(kind: &'static str, reason: &'static str) {
    counter!("ddnssd.event.dropped.count", "type" => kind, "reason" => reason).increment(1);
}

/// Record the outcome of a single backend publish/suppress call.
pub fn record_backend_op(backend: &str, op: &'static str, outcome: &'static str) {
    counter!("ddnssd.backend.op.count", "backend" => backend.to_string(), "op" => op, "outcome" => outcome)
        .increment(1);
}

/// Record a retry inside a backend's bounded budget.
pub fn record_backend_retry(backend: &str, reason: &'static str) {
    counter!("ddnssd.backend.retry.count", "backend" => backend.to_string(), "reason" => reason)
        .increment(1);
}

/// Record a completed reconciliation pass.
pub fn record_reconcile(backend: &str, deleted: usize, created: usize, duration: std::time::Duration) {
    counter!("ddnssd.reconcile.count", "backend" => backend.to_string()).increment(1);
    counter!("ddnssd.reconcile.deleted.count", "backend" => backend.to_string())
        .increment(deleted as u64);
    counter!("ddnssd.reconcile.created.count", "backend" => backend.to_string())
        .increment(created as u64);
    histogram!("ddnssd.reconcile.duration.seconds", "backend" => backend.to_string())
        .record(duration.as_secs_f64());
}

/// Record a watcher reconnect.
pub fn record_watcher_reconnect(reason: ReconnectReason) {
    let reason_str = match reason {
        ReconnectReason::StreamEnded => "stream_ended",
        ReconnectReason::Error => "error",
        ReconnectReason::InitialConnect => "initial_connect",
    };
    counter!("ddnssd.watcher.reconnect.count", "reason" => reason_str).increment(1);
}

/// Reconnect reasons.
#[derive(Debug, Clone, Copy)]
pub enum ReconnectReason {
    /// Event stream ended normally.
    StreamEnded,
    /// The stream or connection errored.
    Error,
    /// First connection to the runtime.
    InitialConnect,
}

/// Record tracked container counts (call on change).
pub fn record_container_counts(tracked: usize, crashed: usize) {
    gauge!("ddnssd.containers.tracked").set(tracked as f64);
    gauge!("ddnssd.containers.crashed").set(crashed as f64);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
