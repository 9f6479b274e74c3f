//! Error types for tilequeue-rs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The queue endpoint could not be reached. Recovered locally by the
    /// listing and submission paths, propagated everywhere else.
    #[error("queue unreachable: {0}")]
    Connectivity(String),

    /// The backend answered but refused the request.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("undecodable message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("malformed message: {0}")]
    Malformed(String),

    /// Deleting an item that did not come from `QueueStore::list`.
    #[error("work item has no receipt attached")]
    MissingReceipt,

    #[error("invalid tile coordinate: {0}")]
    InvalidTileCoord(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a transient connectivity failure (as opposed to a refusal or a bug)?
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Connectivity(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Error::Connectivity(e.to_string()),
            other => Error::Database(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
