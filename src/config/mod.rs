//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in `secrecy::SecretString` so it
//! never lands in logs. A TOML file may override the queue settings.

pub mod secrets;

use crate::backend::{MAX_BATCH_SIZE, PgmqOptions};
use crate::error::{Error, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// pgmq queue name.
    pub queue: String,
    /// Seconds a received tile stays hidden from other consumers.
    pub visibility_timeout: u32,
    /// Seconds a receive call long-polls for messages.
    pub receive_wait: u32,
    pub batch_size: usize,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// Optional TOML overrides. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Overrides {
    queue: Option<String>,
    visibility_timeout: Option<u32>,
    receive_wait: Option<u32>,
    batch_size: Option<usize>,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            queue: std::env::var("TILEQ_QUEUE").unwrap_or_else(|_| "tiles".to_string()),
            visibility_timeout: parsed_var("TILEQ_VISIBILITY_TIMEOUT", 60)?,
            receive_wait: parsed_var("TILEQ_WAIT_TIME", 0)?,
            batch_size: parsed_var("TILEQ_BATCH_SIZE", MAX_BATCH_SIZE)?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        };
        config.validate()
    }

    /// Apply overrides from a TOML file on top of the environment.
    pub fn with_overrides_file(self, path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let overrides: Overrides = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid {}: {e}", path.display())))?;
        self.apply(overrides).validate()
    }

    /// Queue settings for the pgmq backend.
    pub fn pgmq_options(&self) -> PgmqOptions {
        PgmqOptions {
            queue: self.queue.clone(),
            visibility_timeout: self.visibility_timeout,
            receive_wait: self.receive_wait,
            ..PgmqOptions::default()
        }
    }

    fn apply(mut self, overrides: Overrides) -> Self {
        if let Some(queue) = overrides.queue {
            self.queue = queue;
        }
        if let Some(timeout) = overrides.visibility_timeout {
            self.visibility_timeout = timeout;
        }
        if let Some(wait) = overrides.receive_wait {
            self.receive_wait = wait;
        }
        if let Some(size) = overrides.batch_size {
            self.batch_size = size;
        }
        if overrides.otel_endpoint.is_some() {
            self.otel_endpoint = overrides.otel_endpoint;
        }
        if let Some(level) = overrides.log_level {
            self.log_level = level;
        }
        self
    }

    fn validate(self) -> Result<Self> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(Error::Config(format!(
                "batch size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.visibility_timeout == 0 {
            return Err(Error::Config(
                "visibility timeout must be at least 1 second".to_string(),
            ));
        }
        let limit = i32::MAX as u32;
        if self.visibility_timeout > limit || self.receive_wait > limit {
            return Err(Error::Config(format!(
                "visibility timeout and receive wait must not exceed {limit} seconds"
            )));
        }
        if self.queue.is_empty() {
            return Err(Error::Config("queue name must not be empty".to_string()));
        }
        Ok(self)
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        Err(_) => Ok(default),
    }
}
