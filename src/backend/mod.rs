//! Queue backends.
//!
//! A backend is a remote, at-least-once queue with batched receive/send,
//! per-delivery receipts, a visibility timeout and approximate depth counters.
//! The store only ever talks to it through [`QueueBackend`].

pub mod memory;
pub mod pgmq;

pub use self::memory::MemoryBackend;
pub use self::pgmq::{PgmqBackend, PgmqOptions};

use crate::error::Result;
use crate::model::{QueueStatus, Receipt};
use std::future::Future;

/// Most messages a single receive or send call may carry. A hard queue limit,
/// not a tuning knob.
pub const MAX_BATCH_SIZE: usize = 10;

/// One delivery of a message, as returned by a receive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub body: String,
    pub receipt: Receipt,
}

/// One entry of a batched send. `id` is echoed back in failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub id: String,
    pub body: String,
}

/// Outcome of a batched send. Entries not listed in `failed` were accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResponse {
    pub failed: Vec<BatchFailure>,
}

/// A single rejected entry of a batched send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub id: String,
    pub code: String,
    pub message: String,
}

impl std::fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Capability set consumed by `QueueStore`.
///
/// Connectivity failures must surface as `Error::Connectivity` so callers can
/// tell them apart from refusals.
pub trait QueueBackend: Send + Sync {
    /// Queue name, for logs and metrics.
    fn name(&self) -> &str;

    /// Receive up to `max` messages in one round trip, hiding each for the
    /// visibility timeout.
    fn receive_batch(&self, max: usize) -> impl Future<Output = Result<Vec<RawMessage>>> + Send;

    fn send_one(&self, body: String) -> impl Future<Output = Result<()>> + Send;

    fn send_batch(
        &self,
        entries: Vec<BatchEntry>,
    ) -> impl Future<Output = Result<BatchResponse>> + Send;

    /// Delete the delivery identified by `receipt`. A stale receipt is not an
    /// error.
    fn delete(&self, receipt: &Receipt) -> impl Future<Output = Result<()>> + Send;

    fn attributes(&self) -> impl Future<Output = Result<QueueStatus>> + Send;
}
