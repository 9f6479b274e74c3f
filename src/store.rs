//! Queue-backed tile store.
//!
//! Turns an at-least-once queue into a pull-based listing of work items and a
//! push-based submission path. Steady-state paths (`list`, `put`, `put_one`)
//! absorb connectivity failures: the listing treats them as an empty round and
//! submissions record them on the affected items. Administrative paths
//! (`get_status`, `delete_one`) propagate them.
//!
//! # Lifecycle of a delivery
//!
//! ```text
//! Pending --list()--> InFlight --delete_one()--> Deleted
//!                        |
//!                        +--visibility timeout--> Pending (new receipt)
//! ```
//!
//! Malformed messages go straight from InFlight to Deleted without ever being
//! yielded.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use futures::Stream;
use opentelemetry::KeyValue;
use tracing::{Instrument, debug, error, warn};

pub use crate::backend::MAX_BATCH_SIZE;
use crate::backend::{BatchEntry, QueueBackend, RawMessage};
use crate::codec::{decode_message, encode_message};
use crate::error::{Error, Result};
use crate::model::{QueueStatus, WorkItem};
use crate::telemetry::{metrics, store as spans};

// ---------------------------------------------------------------------------
// On-empty hook
// ---------------------------------------------------------------------------

/// Decides what a listing does after a round that returned nothing.
///
/// Returning `true` ends the listing; `false` polls again. Any backoff before
/// the next poll is the hook's business.
pub trait OnEmpty<B: QueueBackend>: Send + Sync {
    fn on_empty(&self, backend: &B) -> impl Future<Output = bool> + Send;
}

/// Default hook, see [`maybe_stop`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MaybeStop;

impl<B: QueueBackend> OnEmpty<B> for MaybeStop {
    async fn on_empty(&self, backend: &B) -> bool {
        maybe_stop(backend).await
    }
}

/// Stop on the first empty round, even if items are still in flight.
///
/// For one-shot listings that leave items unacknowledged: waiting on them
/// would only see them redelivered.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopWhenEmpty;

impl<B: QueueBackend> OnEmpty<B> for StopWhenEmpty {
    async fn on_empty(&self, _backend: &B) -> bool {
        true
    }
}

/// Stop once the queue is truly empty.
///
/// - nothing visible and nothing in flight: stop.
/// - nothing visible but some in flight: sleep a quarter of the visibility
///   timeout (in-flight items may come back) and keep polling.
/// - otherwise keep polling right away.
///
/// If the attributes cannot be read the listing stops rather than spin.
pub async fn maybe_stop<B: QueueBackend>(backend: &B) -> bool {
    let status = match backend.attributes().await {
        Ok(status) => status,
        Err(e) if e.is_connectivity() => {
            warn!(queue = backend.name(), error = %e, "queue unreachable while checking for work, stopping");
            return true;
        }
        Err(e) => {
            error!(queue = backend.name(), error = %e, "cannot read queue attributes, stopping");
            return true;
        }
    };

    if status.visible > 0 {
        return false;
    }
    if status.in_flight == 0 {
        debug!(queue = backend.name(), "queue drained");
        return true;
    }

    // Fixed cadence: no jitter, no cap.
    let pause = Duration::from_secs(u64::from(status.visibility_timeout_secs)) / 4;
    debug!(
        queue = backend.name(),
        in_flight = status.in_flight,
        ?pause,
        "waiting on in-flight items"
    );
    tokio::time::sleep(pause).await;
    false
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Work-item store over a queue backend.
///
/// Holds no cache and no shared state: any number of stores, in any number of
/// processes, may poll the same queue. The backend's visibility timeout is the
/// only thing keeping them from processing the same item concurrently.
pub struct QueueStore<B, H = MaybeStop> {
    backend: B,
    on_empty: H,
    batch_size: usize,
}

impl<B: QueueBackend> QueueStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            on_empty: MaybeStop,
            batch_size: MAX_BATCH_SIZE,
        }
    }
}

impl<B: QueueBackend, H> QueueStore<B, H> {
    /// Replace the on-empty hook.
    pub fn with_on_empty<H2: OnEmpty<B>>(self, on_empty: H2) -> QueueStore<B, H2> {
        QueueStore {
            backend: self.backend,
            on_empty,
            batch_size: self.batch_size,
        }
    }

    /// Items per receive/send round trip, clamped to `1..=MAX_BATCH_SIZE`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// A queue cannot answer membership questions. Always `false`.
    pub fn contains(&self, _item: &WorkItem) -> bool {
        false
    }

    /// Acknowledge a received item: delete its delivery, clear its receipt and
    /// hand it back.
    ///
    /// Fails with `Error::MissingReceipt` for items that did not come from
    /// [`QueueStore::list`]. Backend failures propagate.
    pub async fn delete_one(&self, mut item: WorkItem) -> Result<WorkItem> {
        let receipt = item.receipt.as_ref().ok_or(Error::MissingReceipt)?;
        self.backend.delete(receipt).await?;
        item.receipt = None;
        Ok(item)
    }

    /// Submit one item. Never fails: a failed send is recorded in `item.error`.
    pub async fn put_one(&self, mut item: WorkItem) -> WorkItem {
        let body = match encode_message(&item.payload) {
            Ok(body) => body,
            Err(e) => {
                self.fail_item(&mut item, "encode", e.to_string());
                return item;
            }
        };
        if let Err(e) = self.backend.send_one(body).await {
            let reason = if e.is_connectivity() {
                "unreachable"
            } else {
                "rejected"
            };
            self.fail_item(&mut item, reason, e.to_string());
        }
        item
    }

    /// Submit items in batches of `batch_size`.
    ///
    /// Lazy: nothing is read from `items` or sent until the returned cursor is
    /// pulled. Every input item comes back exactly once, in input order, after
    /// the batch holding it was sent, so its `error` is final when observed.
    pub fn put<I>(&self, items: I) -> PutBatches<'_, B, H, I::IntoIter>
    where
        I: IntoIterator<Item = WorkItem>,
    {
        PutBatches {
            store: self,
            input: items.into_iter(),
            ready: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Read the queue's attributes. One round trip, not retried; connectivity
    /// failures propagate.
    pub async fn get_status(&self) -> Result<QueueStatus> {
        self.backend.attributes().await
    }

    /// Send one buffered batch, marking failures on the items in place.
    async fn flush(&self, batch: &mut [WorkItem]) {
        let mut entries = Vec::with_capacity(batch.len());
        for (position, item) in batch.iter_mut().enumerate() {
            match encode_message(&item.payload) {
                Ok(body) => entries.push(BatchEntry {
                    id: position.to_string(),
                    body,
                }),
                Err(e) => self.fail_item(item, "encode", e.to_string()),
            }
        }
        if entries.is_empty() {
            return;
        }

        let queue = self.backend.name();
        metrics::batch_size().record(
            entries.len() as u64,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("operation", "send_batch"),
            ],
        );

        let span = spans::send_batch_span(queue, entries.len());
        match self.backend.send_batch(entries).instrument(span).await {
            Ok(response) => {
                for failure in response.failed {
                    let item = failure
                        .id
                        .parse::<usize>()
                        .ok()
                        .and_then(|position| batch.get_mut(position));
                    match item {
                        Some(item) => self.fail_item(item, "rejected", failure.to_string()),
                        None => warn!(
                            queue,
                            id = %failure.id,
                            "batch failure for an entry that was never sent"
                        ),
                    }
                }
            }
            Err(e) => {
                let reason = if e.is_connectivity() {
                    "unreachable"
                } else {
                    "rejected"
                };
                for item in batch.iter_mut() {
                    self.fail_item(item, reason, e.to_string());
                }
            }
        }
    }

    fn fail_item(&self, item: &mut WorkItem, reason: &'static str, message: String) {
        warn!(queue = self.backend.name(), reason, error = %message, "failed to submit work item");
        metrics::items_failed().add(
            1,
            &[
                KeyValue::new("queue", self.backend.name().to_string()),
                KeyValue::new("reason", reason),
            ],
        );
        item.error = Some(message);
    }

    /// Log and acknowledge an undecodable message so it is not redelivered.
    async fn drop_malformed(&self, message: RawMessage, err: Error) {
        let queue = self.backend.name();
        warn!(queue, error = %err, "dropping malformed message");
        metrics::items_malformed().add(1, &[KeyValue::new("queue", queue.to_string())]);
        if let Err(e) = self.backend.delete(&message.receipt).await {
            warn!(queue, error = %e, "failed to delete malformed message");
        }
    }
}

impl<B: QueueBackend, H: OnEmpty<B>> QueueStore<B, H> {
    /// Start a fresh poll loop over the queue.
    ///
    /// The listing is effectively infinite: it ends only when the on-empty
    /// hook says so. Items arrive with their receipt attached; call
    /// [`QueueStore::delete_one`] once each is done or it will be redelivered
    /// after the visibility timeout.
    pub fn list(&self) -> Listing<'_, B, H> {
        Listing {
            store: self,
            buffer: VecDeque::new(),
            stopped: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Pull-based cursor over a queue, created by [`QueueStore::list`].
pub struct Listing<'a, B, H> {
    store: &'a QueueStore<B, H>,
    buffer: VecDeque<WorkItem>,
    stopped: bool,
}

impl<'a, B: QueueBackend, H: OnEmpty<B>> Listing<'a, B, H> {
    /// Next work item, receiving another batch when the buffer runs dry.
    ///
    /// Returns `Ok(None)` once the on-empty hook has stopped the listing.
    /// Connectivity failures are absorbed; any other backend error is returned
    /// and ends the listing.
    pub async fn next(&mut self) -> Result<Option<WorkItem>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            if self.stopped {
                return Ok(None);
            }
            let received = match self.receive().await {
                Ok(received) => received,
                Err(e) => {
                    self.stopped = true;
                    return Err(e);
                }
            };
            if received == 0 && self.store.on_empty.on_empty(&self.store.backend).await {
                self.stopped = true;
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Adapt into a `Stream`, for use with `futures::StreamExt`.
    pub fn into_stream(self) -> impl Stream<Item = Result<WorkItem>> + 'a {
        futures::stream::unfold(self, |mut listing| async move {
            listing.next().await.transpose().map(|item| (item, listing))
        })
    }

    /// One receive round. Returns how many raw messages arrived, malformed
    /// ones included.
    async fn receive(&mut self) -> Result<usize> {
        let store = self.store;
        let queue = store.backend.name();
        let span = spans::receive_span(queue, store.batch_size);

        let messages = match store
            .backend
            .receive_batch(store.batch_size)
            .instrument(span.clone())
            .await
        {
            Ok(messages) => messages,
            Err(e) if e.is_connectivity() => {
                warn!(queue, error = %e, "queue unreachable, treating round as empty");
                metrics::connectivity_errors().add(
                    1,
                    &[
                        KeyValue::new("queue", queue.to_string()),
                        KeyValue::new("operation", "receive"),
                    ],
                );
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let received = messages.len();
        spans::record_received(&span, received);
        if received > 0 {
            metrics::batch_size().record(
                received as u64,
                &[
                    KeyValue::new("queue", queue.to_string()),
                    KeyValue::new("operation", "receive"),
                ],
            );
        }

        for message in messages {
            match decode_message(&message.body) {
                Ok(payload) => self.buffer.push_back(WorkItem {
                    payload,
                    error: None,
                    receipt: Some(message.receipt),
                }),
                Err(e) => store.drop_malformed(message, e).await,
            }
        }
        Ok(received)
    }
}

// ---------------------------------------------------------------------------
// Batched submission
// ---------------------------------------------------------------------------

/// Cursor over a batched submission, created by [`QueueStore::put`].
///
/// Dropping it early leaves the unread remainder of the input unsent.
pub struct PutBatches<'a, B, H, I> {
    store: &'a QueueStore<B, H>,
    input: I,
    ready: VecDeque<WorkItem>,
    exhausted: bool,
}

impl<'a, B, H, I> PutBatches<'a, B, H, I>
where
    B: QueueBackend,
    I: Iterator<Item = WorkItem>,
{
    /// Next submitted item, sending another batch when needed. `None` once
    /// the input is exhausted and every batch has been sent.
    pub async fn next(&mut self) -> Option<WorkItem> {
        if self.ready.is_empty() && !self.exhausted {
            self.fill().await;
        }
        self.ready.pop_front()
    }

    /// Pull everything through and collect the submitted items.
    pub async fn collect(mut self) -> Vec<WorkItem> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item);
        }
        items
    }

    /// Adapt into a `Stream`, for use with `futures::StreamExt`.
    pub fn into_stream(self) -> impl Stream<Item = WorkItem> + 'a
    where
        I: 'a,
    {
        futures::stream::unfold(self, |mut batches| async move {
            batches.next().await.map(|item| (item, batches))
        })
    }

    /// Buffer up to one batch from the input and send it. A short final batch
    /// is sent as soon as the input runs out.
    async fn fill(&mut self) {
        let mut batch = Vec::with_capacity(self.store.batch_size);
        while batch.len() < self.store.batch_size {
            match self.input.next() {
                Some(item) => batch.push(item),
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }
        if !batch.is_empty() {
            self.store.flush(&mut batch).await;
        }
        self.ready.extend(batch);
    }
}
