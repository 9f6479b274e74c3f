//! pgmq queue backend via direct SQLx.
//!
//! Calls pgmq's SQL functions (pgmq.create, pgmq.send, pgmq.send_batch,
//! pgmq.read, pgmq.read_with_poll) and reads the queue table directly for
//! receipt-checked deletes and depth counters.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::debug;

use super::{BatchEntry, BatchResponse, QueueBackend, RawMessage};
use crate::error::{Error, Result};
use crate::model::{QueueStatus, Receipt};
use crate::telemetry::metrics;

/// pgmq prefixes table names, which caps queue names well below Postgres's 63.
const MAX_QUEUE_NAME_LEN: usize = 47;

/// Queue settings applied on every read.
#[derive(Debug, Clone)]
pub struct PgmqOptions {
    pub queue: String,
    /// Visibility timeout (seconds) for pgmq reads.
    pub visibility_timeout: u32,
    /// Long-poll duration (seconds); 0 reads without waiting.
    pub receive_wait: u32,
    pub max_connections: u32,
}

impl Default for PgmqOptions {
    fn default() -> Self {
        Self {
            queue: "tiles".to_string(),
            visibility_timeout: 60,
            receive_wait: 0,
            max_connections: 10,
        }
    }
}

/// A pgmq queue. Owns the connection pool.
pub struct PgmqBackend {
    pool: PgPool,
    options: PgmqOptions,
}

impl PgmqBackend {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, options: PgmqOptions) -> Result<Self> {
        validate_queue_name(&options.queue)?;
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool, options })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool, options: PgmqOptions) -> Result<Self> {
        validate_queue_name(&options.queue)?;
        Ok(Self { pool, options })
    }

    /// Run all pending migrations (installs the pgmq extension).
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Create the queue (idempotent).
    pub async fn create_queue(&self) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(&self.options.queue)
            .execute(&self.pool)
            .await?;
        self.record("create");
        Ok(())
    }

    pub fn options(&self) -> &PgmqOptions {
        &self.options
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fully-qualified queue table. Safe to splice into SQL: the name was
    /// validated at construction.
    fn table(&self) -> String {
        format!("pgmq.q_{}", self.options.queue)
    }

    fn record(&self, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.options.queue.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

fn validate_queue_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_QUEUE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "invalid pgmq queue name {name:?}: use lowercase letters, digits and underscores"
        )))
    }
}

/// Visibility timeout and poll wait as the `integer` arguments pgmq takes.
fn read_params(options: &PgmqOptions) -> Result<(i32, i32)> {
    let int = |name: &str, value: u32| {
        i32::try_from(value)
            .map_err(|_| Error::Config(format!("{name} of {value}s exceeds the pgmq limit")))
    };
    Ok((
        int("visibility timeout", options.visibility_timeout)?,
        int("receive wait", options.receive_wait)?,
    ))
}

/// pgmq stores jsonb. Bodies that are JSON go in as-is so the queue stays
/// inspectable; anything else is stored as a JSON string.
fn body_to_json(body: String) -> serde_json::Value {
    serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body))
}

fn json_to_body(message: serde_json::Value) -> String {
    match message {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Receipts pin a delivery: the message id plus the read count pgmq assigned
/// when it was handed out. A redelivery bumps the read count.
fn encode_receipt(msg_id: i64, read_ct: i32) -> Receipt {
    Receipt(format!("{msg_id}:{read_ct}"))
}

fn decode_receipt(receipt: &Receipt) -> Result<(i64, i32)> {
    receipt
        .as_str()
        .split_once(':')
        .and_then(|(id, ct)| Some((id.parse().ok()?, ct.parse().ok()?)))
        .ok_or_else(|| Error::Backend(format!("not a pgmq receipt: {receipt}")))
}

type ReadRow = (i64, i32, serde_json::Value);

impl QueueBackend for PgmqBackend {
    fn name(&self) -> &str {
        &self.options.queue
    }

    async fn receive_batch(&self, max: usize) -> Result<Vec<RawMessage>> {
        let (vt, wait) = read_params(&self.options)?;
        let qty = i32::try_from(max).unwrap_or(i32::MAX);
        let rows: Vec<ReadRow> = if wait > 0 {
            sqlx::query_as(
                "SELECT msg_id, read_ct, message FROM pgmq.read_with_poll($1, $2, $3, $4)",
            )
            .bind(&self.options.queue)
            .bind(vt)
            .bind(qty)
            .bind(wait)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as("SELECT msg_id, read_ct, message FROM pgmq.read($1, $2, $3)")
                .bind(&self.options.queue)
                .bind(vt)
                .bind(qty)
                .fetch_all(&self.pool)
                .await?
        };

        self.record(if rows.is_empty() { "read_empty" } else { "read" });

        Ok(rows
            .into_iter()
            .map(|(msg_id, read_ct, message)| RawMessage {
                body: json_to_body(message),
                receipt: encode_receipt(msg_id, read_ct),
            })
            .collect())
    }

    async fn send_one(&self, body: String) -> Result<()> {
        sqlx::query("SELECT pgmq.send($1, $2)")
            .bind(&self.options.queue)
            .bind(body_to_json(body))
            .execute(&self.pool)
            .await?;
        self.record("send");
        Ok(())
    }

    /// pgmq inserts a batch in one statement, so it is accepted or refused as a
    /// whole; per-entry failures never occur.
    async fn send_batch(&self, entries: Vec<BatchEntry>) -> Result<BatchResponse> {
        let bodies: Vec<serde_json::Value> =
            entries.into_iter().map(|e| body_to_json(e.body)).collect();
        sqlx::query("SELECT pgmq.send_batch($1, $2)")
            .bind(&self.options.queue)
            .bind(bodies)
            .execute(&self.pool)
            .await?;
        self.record("send_batch");
        Ok(BatchResponse::default())
    }

    async fn delete(&self, receipt: &Receipt) -> Result<()> {
        let (msg_id, read_ct) = decode_receipt(receipt)?;
        let deleted: Option<(i64,)> = sqlx::query_as(&format!(
            "DELETE FROM {} WHERE msg_id = $1 AND read_ct = $2 RETURNING msg_id",
            self.table()
        ))
        .bind(msg_id)
        .bind(read_ct)
        .fetch_optional(&self.pool)
        .await?;

        if deleted.is_none() {
            debug!(queue = %self.options.queue, %receipt, "stale receipt, nothing deleted");
        }
        self.record("delete");
        Ok(())
    }

    async fn attributes(&self) -> Result<QueueStatus> {
        let (visible, in_flight, newest): (i64, i64, Option<DateTime<Utc>>) =
            sqlx::query_as(&format!(
                "SELECT count(*) FILTER (WHERE vt <= clock_timestamp()),
                        count(*) FILTER (WHERE vt > clock_timestamp()),
                        max(enqueued_at)
                 FROM {}",
                self.table()
            ))
            .fetch_one(&self.pool)
            .await?;

        let created: Option<(DateTime<Utc>,)> =
            sqlx::query_as("SELECT created_at FROM pgmq.meta WHERE queue_name = $1")
                .bind(&self.options.queue)
                .fetch_optional(&self.pool)
                .await?;

        self.record("attributes");

        Ok(QueueStatus {
            visible: visible as u64,
            in_flight: in_flight as u64,
            visibility_timeout_secs: self.options.visibility_timeout,
            receive_wait_secs: self.options.receive_wait,
            created_at: created.map(|(t,)| t),
            last_modified_at: newest,
        })
    }
}
