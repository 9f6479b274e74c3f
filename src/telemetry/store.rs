//! Span helpers for queue store round trips.

use tracing::Span;

/// Span for one receive round of a listing.
///
/// `queue.received` is declared empty and filled in with [`record_received`].
pub fn receive_span(queue: &str, max: usize) -> Span {
    tracing::debug_span!(
        "queue.receive",
        "queue.name" = queue,
        "queue.max" = max,
        "queue.received" = tracing::field::Empty,
    )
}

/// Record how many messages a receive round returned.
pub fn record_received(span: &Span, received: usize) {
    span.record("queue.received", received);
}

/// Span for one batched send.
pub fn send_batch_span(queue: &str, size: usize) -> Span {
    tracing::debug_span!("queue.send_batch", "queue.name" = queue, "queue.size" = size)
}
