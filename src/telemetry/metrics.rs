//! Metric instrument factories for tilequeue-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"tilequeue-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for tilequeue-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("tilequeue-rs")
}

/// Counter: backend round trips (receive, send, send_batch, delete, attributes).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("tilequeue.queue.operations")
        .with_description("Number of queue backend operations")
        .build()
}

/// Counter: messages that could not be decoded and were dropped.
/// Labels: `queue`.
pub fn items_malformed() -> Counter<u64> {
    meter()
        .u64_counter("tilequeue.items.malformed")
        .with_description("Malformed messages deleted without being delivered")
        .build()
}

/// Counter: work items whose submission failed.
/// Labels: `queue`, `reason` ("rejected" | "unreachable" | "encode").
pub fn items_failed() -> Counter<u64> {
    meter()
        .u64_counter("tilequeue.items.failed")
        .with_description("Work items that could not be submitted")
        .build()
}

/// Counter: rounds that ended with the transient fault swallowed.
/// Labels: `queue`, `operation`.
pub fn connectivity_errors() -> Counter<u64> {
    meter()
        .u64_counter("tilequeue.queue.connectivity_errors")
        .with_description("Queue round trips that failed to reach the backend")
        .build()
}

/// Histogram: items per backend batch.
/// Labels: `queue`, `operation` ("receive" | "send_batch").
pub fn batch_size() -> Histogram<u64> {
    meter()
        .u64_histogram("tilequeue.queue.batch_size")
        .with_description("Items carried by one batched round trip")
        .build()
}
