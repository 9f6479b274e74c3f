//! In-process queue backend.
//!
//! Behaves like a remote visibility-timeout queue: received messages are
//! hidden until deleted or until their timeout lapses, after which they are
//! redelivered under a fresh receipt. Faults can be injected per operation and
//! every call is recorded, which is what the store tests lean on.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{BatchEntry, BatchFailure, BatchResponse, MAX_BATCH_SIZE, QueueBackend, RawMessage};
use crate::error::{Error, Result};
use crate::model::{QueueStatus, Receipt};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Backend operation, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Receive,
    Send,
    SendBatch,
    Delete,
    Attributes,
}

/// How an injected fault fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    #[default]
    None,
    /// Connectivity failure on the next `n` calls, then recover.
    Next(u32),
    /// Connectivity failure on every call.
    Always,
    /// The queue answers but refuses every call.
    Refuse,
}

/// A recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Receive { max: usize, returned: usize },
    SendOne,
    SendBatch { size: usize, rejected: usize },
    Delete { found: bool },
    Attributes,
    /// The call hit an injected fault.
    Failed(Op),
}

type RejectFn = Box<dyn Fn(&str) -> bool + Send + Sync>;

struct Stored {
    body: String,
    invisible_until: Option<Instant>,
    receipt: Option<String>,
}

impl Stored {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.is_none_or(|until| until <= now)
    }
}

struct State {
    messages: VecDeque<Stored>,
    faults: HashMap<Op, Fault>,
    reject: Option<RejectFn>,
    calls: Vec<Call>,
    created_at: DateTime<Utc>,
}

impl State {
    /// Consume one shot of the fault configured for `op`, if any.
    fn trip(&mut self, op: Op) -> Option<Error> {
        let err = match self.faults.get_mut(&op) {
            Some(Fault::Always) => Error::Connectivity(format!("{op:?}: simulated outage")),
            Some(Fault::Next(n)) if *n > 0 => {
                *n -= 1;
                Error::Connectivity(format!("{op:?}: simulated outage"))
            }
            Some(Fault::Refuse) => Error::Backend(format!("{op:?}: refused")),
            _ => return None,
        };
        self.calls.push(Call::Failed(op));
        Some(err)
    }
}

/// Seconds, rounded up so a sub-second timeout never reports as zero.
fn whole_secs(duration: Duration) -> u32 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    u32::try_from(secs).unwrap_or(u32::MAX)
}

/// In-memory queue. Clones share the same queue.
#[derive(Clone)]
pub struct MemoryBackend {
    name: Arc<str>,
    visibility_timeout: Duration,
    receive_wait: Duration,
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            visibility_timeout: Duration::from_secs(30),
            receive_wait: Duration::ZERO,
            state: Arc::new(Mutex::new(State {
                messages: VecDeque::new(),
                faults: HashMap::new(),
                reject: None,
                calls: Vec::new(),
                created_at: Utc::now(),
            })),
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Long-poll receives for up to `wait` when nothing is visible.
    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    /// Inject failures into `op`.
    pub async fn fail(&self, op: Op, fault: Fault) {
        self.state.lock().await.faults.insert(op, fault);
    }

    /// Reject batched-send entries whose body matches `predicate`.
    pub async fn reject_when(&self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) {
        self.state.lock().await.reject = Some(Box::new(predicate));
    }

    /// Enqueue a body as-is, bypassing encoding. Used to plant malformed messages.
    pub async fn push_raw(&self, body: impl Into<String>) {
        self.state.lock().await.messages.push_back(Stored {
            body: body.into(),
            invisible_until: None,
            receipt: None,
        });
    }

    /// Every call made so far, in order.
    pub async fn calls(&self) -> Vec<Call> {
        self.state.lock().await.calls.clone()
    }

    /// Number of messages returned by each successful receive call.
    pub async fn receive_sizes(&self) -> Vec<usize> {
        self.calls()
            .await
            .into_iter()
            .filter_map(|c| match c {
                Call::Receive { returned, .. } => Some(returned),
                _ => None,
            })
            .collect()
    }

    /// Number of entries in each successful batched send.
    pub async fn send_batch_sizes(&self) -> Vec<usize> {
        self.calls()
            .await
            .into_iter()
            .filter_map(|c| match c {
                Call::SendBatch { size, .. } => Some(size),
                _ => None,
            })
            .collect()
    }

    /// Number of delete calls that reached the queue.
    pub async fn delete_count(&self) -> usize {
        self.calls()
            .await
            .iter()
            .filter(|c| matches!(c, Call::Delete { .. }))
            .count()
    }

    /// Bodies of every stored message, visible or not.
    pub async fn bodies(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.messages.iter().map(|m| m.body.clone()).collect()
    }

    fn record(&self, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.to_string()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

fn check_batch_size(requested: usize) -> Result<()> {
    if requested > MAX_BATCH_SIZE {
        return Err(Error::Backend(format!(
            "batch of {requested} exceeds the limit of {MAX_BATCH_SIZE}"
        )));
    }
    Ok(())
}

impl QueueBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive_batch(&self, max: usize) -> Result<Vec<RawMessage>> {
        check_batch_size(max)?;
        let deadline = Instant::now() + self.receive_wait;
        loop {
            let now = Instant::now();
            {
                let mut state = self.state.lock().await;
                if let Some(err) = state.trip(Op::Receive) {
                    return Err(err);
                }

                let mut received = Vec::new();
                for message in state.messages.iter_mut() {
                    if received.len() >= max {
                        break;
                    }
                    if !message.is_visible(now) {
                        continue;
                    }
                    let receipt = Uuid::new_v4().to_string();
                    message.receipt = Some(receipt.clone());
                    message.invisible_until = Some(now + self.visibility_timeout);
                    received.push(RawMessage {
                        body: message.body.clone(),
                        receipt: Receipt(receipt),
                    });
                }

                if !received.is_empty() || now >= deadline {
                    state.calls.push(Call::Receive {
                        max,
                        returned: received.len(),
                    });
                    self.record(if received.is_empty() {
                        "receive_empty"
                    } else {
                        "receive"
                    });
                    return Ok(received);
                }
            }
            tokio::time::sleep((deadline - now).min(Duration::from_millis(100))).await;
        }
    }

    async fn send_one(&self, body: String) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.trip(Op::Send) {
            return Err(err);
        }
        state.messages.push_back(Stored {
            body,
            invisible_until: None,
            receipt: None,
        });
        state.calls.push(Call::SendOne);
        self.record("send");
        Ok(())
    }

    async fn send_batch(&self, entries: Vec<BatchEntry>) -> Result<BatchResponse> {
        check_batch_size(entries.len())?;
        let mut state = self.state.lock().await;
        if let Some(err) = state.trip(Op::SendBatch) {
            return Err(err);
        }

        let size = entries.len();
        let mut response = BatchResponse::default();
        for entry in entries {
            let rejected = state.reject.as_ref().is_some_and(|reject| reject(&entry.body));
            if rejected {
                response.failed.push(BatchFailure {
                    id: entry.id,
                    code: "Rejected".to_string(),
                    message: "message refused by queue".to_string(),
                });
            } else {
                state.messages.push_back(Stored {
                    body: entry.body,
                    invisible_until: None,
                    receipt: None,
                });
            }
        }

        state.calls.push(Call::SendBatch {
            size,
            rejected: response.failed.len(),
        });
        self.record("send_batch");
        Ok(response)
    }

    async fn delete(&self, receipt: &Receipt) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.trip(Op::Delete) {
            return Err(err);
        }
        let position = state
            .messages
            .iter()
            .position(|m| m.receipt.as_deref() == Some(receipt.as_str()));
        if let Some(position) = position {
            state.messages.remove(position);
        }
        state.calls.push(Call::Delete {
            found: position.is_some(),
        });
        self.record("delete");
        Ok(())
    }

    async fn attributes(&self) -> Result<QueueStatus> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.trip(Op::Attributes) {
            return Err(err);
        }
        let now = Instant::now();
        let visible = state.messages.iter().filter(|m| m.is_visible(now)).count() as u64;
        let in_flight = state.messages.len() as u64 - visible;
        state.calls.push(Call::Attributes);

        Ok(QueueStatus {
            visible,
            in_flight,
            visibility_timeout_secs: whole_secs(self.visibility_timeout),
            receive_wait_secs: whole_secs(self.receive_wait),
            created_at: Some(state.created_at),
            // Attributes never change after creation.
            last_modified_at: Some(state.created_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sub_second_timeouts_report_as_one_second() {
        let queue = MemoryBackend::new("t")
            .with_visibility_timeout(Duration::from_millis(400))
            .with_receive_wait(Duration::from_millis(1500));
        let status = queue.attributes().await.unwrap();
        assert_eq!(status.visibility_timeout_secs, 1);
        assert_eq!(status.receive_wait_secs, 2);
        assert_eq!(whole_secs(Duration::from_secs(30)), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn received_messages_are_hidden_until_timeout() {
        let queue = MemoryBackend::new("t").with_visibility_timeout(Duration::from_secs(8));
        queue.push_raw("a").await;

        let first = queue.receive_batch(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(queue.receive_batch(10).await.unwrap().is_empty());

        let status = queue.attributes().await.unwrap();
        assert_eq!((status.visible, status.in_flight), (0, 1));

        tokio::time::advance(Duration::from_secs(9)).await;
        let again = queue.receive_batch(10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].body, "a");
        assert_ne!(again[0].receipt, first[0].receipt);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_receipt_delete_is_a_no_op() {
        let queue = MemoryBackend::new("t").with_visibility_timeout(Duration::from_secs(4));
        queue.push_raw("a").await;
        let stale = queue.receive_batch(1).await.unwrap().remove(0).receipt;

        tokio::time::advance(Duration::from_secs(5)).await;
        let fresh = queue.receive_batch(1).await.unwrap().remove(0).receipt;

        queue.delete(&stale).await.unwrap();
        assert_eq!(queue.bodies().await.len(), 1);

        queue.delete(&fresh).await.unwrap();
        assert!(queue.bodies().await.is_empty());
        assert_eq!(
            queue.calls().await.last(),
            Some(&Call::Delete { found: true })
        );
    }

    #[tokio::test]
    async fn faults_fire_then_recover() {
        let queue = MemoryBackend::new("t");
        queue.fail(Op::Receive, Fault::Next(2)).await;

        assert!(queue.receive_batch(10).await.unwrap_err().is_connectivity());
        assert!(queue.receive_batch(10).await.unwrap_err().is_connectivity());
        assert!(queue.receive_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enforces_batch_limit() {
        let queue = MemoryBackend::new("t");
        assert!(queue.receive_batch(11).await.is_err());

        let entries = (0..11)
            .map(|i| BatchEntry {
                id: i.to_string(),
                body: "{}".to_string(),
            })
            .collect();
        assert!(queue.send_batch(entries).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn receive_waits_for_late_messages() {
        let queue = MemoryBackend::new("t").with_receive_wait(Duration::from_secs(2));
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            producer.push_raw("late").await;
        });

        let received = queue.receive_batch(10).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body, "late");
    }
}
