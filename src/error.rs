//! Error types shared across the broker, the query engines and the sinks.
//!
//! Each enum exposes `as_label` returning a short stable snake_case label
//! for log fields.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by [`Publisher`](crate::broker::Publisher) and
/// [`Subscriber`](crate::broker::Subscriber) operations.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The caller's cancellation token fired before or during the call.
    #[error("operation cancelled")]
    Cancelled,
}

impl BrokerError {
    pub fn as_label(&self) -> &'static str {
        match self {
            BrokerError::Cancelled => "broker_cancelled",
        }
    }
}

/// Errors returned by [`LogStore::query`](crate::query::LogStore::query).
///
/// "No matching data" is never an error; it is an empty result.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum QueryError {
    /// The caller's cancellation token fired while the query was running.
    #[error("query cancelled")]
    Cancelled,

    /// A context window was requested without a session or client scope.
    #[error("context window (before={before}, after={after}) requires session_id or client_id")]
    MissingIdentityScope { before: usize, after: usize },

    /// A request parameter could not be interpreted.
    #[error("invalid query parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// The requested store is not configured.
    #[error("store `{0}` is not available")]
    StoreUnavailable(String),

    /// The log directory could not be listed.
    #[error("log directory {path} is unavailable: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A log file could not be opened or read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The columnar backend failed or returned an unreadable response.
    #[error("storage backend failed: {0}")]
    Storage(String),
}

impl QueryError {
    pub fn as_label(&self) -> &'static str {
        match self {
            QueryError::Cancelled => "query_cancelled",
            QueryError::MissingIdentityScope { .. } => "query_missing_identity_scope",
            QueryError::InvalidParameter { .. } => "query_invalid_parameter",
            QueryError::StoreUnavailable(_) => "query_store_unavailable",
            QueryError::Directory { .. } => "query_directory",
            QueryError::Io { .. } => "query_io",
            QueryError::Storage(_) => "query_storage",
        }
    }

    /// `true` for errors caused by the request itself rather than storage.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            QueryError::MissingIdentityScope { .. } | QueryError::InvalidParameter { .. }
        )
    }
}

/// Errors produced by [`BatchSink`](crate::sink::BatchSink)s and the
/// [`SinkRunner`](crate::sink::SinkRunner) loop.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SinkError {
    /// The runner was cancelled.
    #[error("sink cancelled")]
    Cancelled,

    /// The downstream store could not be reached.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Connection attempts were exhausted.
    #[error("gave up connecting after {attempts} attempts: {last}")]
    ConnectExhausted { attempts: u32, last: String },

    /// The downstream store rejected or failed a batch.
    #[error("persist failed: {0}")]
    Persist(String),

    /// A batch did not complete within the configured timeout.
    #[error("persist timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Local file I/O failed.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to subscribe: {0}")]
    Subscribe(#[from] BrokerError),
}

impl SinkError {
    pub fn as_label(&self) -> &'static str {
        match self {
            SinkError::Cancelled => "sink_cancelled",
            SinkError::Connect(_) => "sink_connect",
            SinkError::ConnectExhausted { .. } => "sink_connect_exhausted",
            SinkError::Persist(_) => "sink_persist",
            SinkError::Timeout { .. } => "sink_timeout",
            SinkError::Io { .. } => "sink_io",
            SinkError::Encode(_) => "sink_encode",
            SinkError::Subscribe(_) => "sink_subscribe",
        }
    }

    /// Connection failures are retried by the runner; everything else is
    /// fatal to the current batch or to the runner.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Connect(_))
    }
}
