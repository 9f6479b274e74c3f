//! # tilequeue-rs
//!
//! Queue-backed tile store for distributed rendering pipelines.
//!
//! Wraps an at-least-once message queue (pgmq, or an in-process queue for
//! tests) in a [`store::QueueStore`]: a lazy listing of work items with
//! explicit acknowledgement, batched submission with per-item failure
//! reporting, and a status probe. Tracing and OpenTelemetry wiring live in
//! [`telemetry`].

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod model;
pub mod store;
pub mod telemetry;

pub use backend::{MemoryBackend, PgmqBackend, QueueBackend};
pub use error::{Error, Result};
pub use model::{Payload, QueueStatus, Receipt, TileCoord, WorkItem};
pub use store::{
    Listing, MaybeStop, OnEmpty, PutBatches, QueueStore, StopWhenEmpty, maybe_stop,
};
