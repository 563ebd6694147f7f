//! Metrics instrumentation for containerd-dns.
//!
//! All metrics are prefixed with `containerd_dns.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Record a DNS query.
pub fn record_query(record_type: &str, result: QueryResult, duration: std::time::Duration) {
    let result_str = match result {
        QueryResult::Answered => "answered",
        QueryResult::EmptyAaaa => "empty_aaaa",
        QueryResult::Forwarded => "forwarded",
        QueryResult::WriteError => "write_error",
    };

    counter!(
        "containerd_dns.query.count",
        "type" => record_type.to_string(),
        "result" => result_str
    )
    .increment(1);
    histogram!("containerd_dns.query.duration.seconds", "type" => record_type.to_string())
        .record(duration.as_secs_f64());
}

/// Query result type for metrics.
#[derive(Debug, Clone, Copy)]
pub enum QueryResult {
    /// Query answered from the record store.
    Answered,
    /// AAAA query answered with an empty record because only A exists.
    EmptyAaaa,
    /// Query passed to the next handler.
    Forwarded,
    /// The answer could not be written back.
    WriteError,
}

/// Record a lifecycle event seen on the bus.
pub fn record_event(topic: &str) {
    counter!("containerd_dns.watcher.event.count", "topic" => topic.to_string()).increment(1);
}

/// Record an event dropped before dispatch.
pub fn record_event_dropped(reason: &'static str) {
    counter!("containerd_dns.watcher.event.dropped", "reason" => reason).increment(1);
}

/// Record a handler dispatch.
pub fn record_dispatch(topic: &str) {
    counter!("containerd_dns.watcher.dispatch.count", "topic" => topic.to_string()).increment(1);
}

/// Record the number of handler tasks currently running.
pub fn record_in_flight(count: usize) {
    gauge!("containerd_dns.watcher.in_flight").set(count as f64);
}

/// Record a re-subscription to the event bus.
pub fn record_resubscribe(reason: ResubscribeReason) {
    let reason_str = match reason {
        ResubscribeReason::StreamEnded => "stream_ended",
        ResubscribeReason::Error => "error",
        ResubscribeReason::InitialConnect => "initial_connect",
    };

    counter!("containerd_dns.watcher.resubscribe.count", "reason" => reason_str).increment(1);
}

/// Re-subscription reasons.
#[derive(Debug, Clone, Copy)]
pub enum ResubscribeReason {
    /// Event stream ended.
    StreamEnded,
    /// Subscribing failed.
    Error,
    /// First subscription.
    InitialConnect,
}

/// Record the outcome of one resolution strategy.
pub fn record_resolution(strategy: &'static str, outcome: &'static str) {
    counter!("containerd_dns.resolver.attempt.count", "strategy" => strategy, "outcome" => outcome)
        .increment(1);
}

/// Record store sizes.
pub fn record_store_counts(a: usize, aaaa: usize, owned: usize) {
    gauge!("containerd_dns.store.a.count").set(a as f64);
    gauge!("containerd_dns.store.aaaa.count").set(aaaa as f64);
    gauge!("containerd_dns.store.owned.count").set(owned as f64);
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
