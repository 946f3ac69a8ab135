//! Query parameters, the shared filter predicate and the [`LogStore`] trait
//! implemented by both storage backends.

use crate::error::QueryError;
use crate::record::LogRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

/// Result limit applied when a request does not set one.
pub const DEFAULT_LIMIT: usize = 100;

/// Hard upper bound on either side of a context window.
pub const MAX_CONTEXT: usize = 1000;

/// Number of records to return around each anchor.
///
/// Both sides are clamped to [`MAX_CONTEXT`] on construction, so a value
/// of this type is always within bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextWindow {
    before: usize,
    after: usize,
}

impl ContextWindow {
    pub fn new(before: usize, after: usize) -> Self {
        ContextWindow {
            before: before.min(MAX_CONTEXT),
            after: after.min(MAX_CONTEXT),
        }
    }

    /// Resolve the `context` / `before_context` / `after_context` request
    /// triple: `context` sets both sides, the explicit values override it.
    pub fn resolve(context: Option<usize>, before: Option<usize>, after: Option<usize>) -> Self {
        let shared = context.unwrap_or(0);
        Self::new(before.unwrap_or(shared), after.unwrap_or(shared))
    }

    pub fn before(&self) -> usize {
        self.before
    }

    pub fn after(&self) -> usize {
        self.after
    }

    pub fn is_empty(&self) -> bool {
        self.before == 0 && self.after == 0
    }
}

/// Filter and shaping options for a single [`LogStore::query`] call.
///
/// Empty strings are treated the same as `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    /// Inclusive lower bound on the record timestamp.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the record timestamp.
    pub end: Option<DateTime<Utc>>,
    pub level: Option<String>,
    /// Case-insensitive substring of the message.
    pub search: Option<String>,
    pub session_id: Option<String>,
    pub client_id: Option<String>,
    /// Case-insensitive substring of the source.
    pub source: Option<String>,
    /// Case-insensitive substring of the error text.
    pub error: Option<String>,
    /// Maximum number of records; `0` means [`DEFAULT_LIMIT`].
    pub limit: usize,
    pub window: ContextWindow,
}

fn active(filter: &Option<String>) -> Option<&str> {
    filter.as_deref().filter(|value| !value.is_empty())
}

/// Case-insensitive substring test used by every backend.
pub fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Case-insensitive equality used by every backend. Folds full Unicode,
/// not just ASCII.
pub fn eq_ignore_case(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

impl QueryParams {
    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            DEFAULT_LIMIT
        } else {
            self.limit
        }
    }

    pub fn level_filter(&self) -> Option<&str> {
        active(&self.level)
    }

    pub fn search_filter(&self) -> Option<&str> {
        active(&self.search)
    }

    pub fn session_filter(&self) -> Option<&str> {
        active(&self.session_id)
    }

    pub fn client_filter(&self) -> Option<&str> {
        active(&self.client_id)
    }

    pub fn source_filter(&self) -> Option<&str> {
        active(&self.source)
    }

    pub fn error_filter(&self) -> Option<&str> {
        active(&self.error)
    }

    /// `true` when the params pin a single session or client timeline.
    pub fn has_identity_scope(&self) -> bool {
        self.session_filter().is_some() || self.client_filter().is_some()
    }

    /// Reject a context window that is not scoped to one identity.
    pub fn validate(&self) -> Result<(), QueryError> {
        if !self.window.is_empty() && !self.has_identity_scope() {
            return Err(QueryError::MissingIdentityScope {
                before: self.window.before(),
                after: self.window.after(),
            });
        }
        Ok(())
    }

    /// The shared filter predicate: every supplied filter must match.
    pub fn matches(&self, record: &LogRecord) -> bool {
        if let Some(start) = self.start {
            if record.time < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if record.time > end {
                return false;
            }
        }
        if let Some(level) = self.level_filter() {
            if !eq_ignore_case(record.level.as_str(), level) {
                return false;
            }
        }
        if let Some(search) = self.search_filter() {
            if !contains_ignore_case(&record.message, search) {
                return false;
            }
        }
        if let Some(session) = self.session_filter() {
            if !eq_ignore_case(&record.session_id, session) {
                return false;
            }
        }
        if let Some(client) = self.client_filter() {
            if !eq_ignore_case(&record.client_id, client) {
                return false;
            }
        }
        if let Some(source) = self.source_filter() {
            if !contains_ignore_case(&record.source, source) {
                return false;
            }
        }
        if let Some(error) = self.error_filter() {
            if !contains_ignore_case(record.error.as_deref().unwrap_or(""), error) {
                return false;
            }
        }
        true
    }
}

/// Which persisted backend a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    File,
    Clickhouse,
}

/// Raw query parameters as they arrive from a transport (URL query
/// string or JSON body).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueryRequest {
    pub subscriber_type: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub limit: Option<usize>,
    pub level: Option<String>,
    pub search: Option<String>,
    pub session_id: Option<String>,
    pub client_id: Option<String>,
    pub source: Option<String>,
    pub error: Option<String>,
    pub context: Option<usize>,
    pub before_context: Option<usize>,
    pub after_context: Option<usize>,
}

fn parse_time(name: &'static str, value: &Option<String>) -> Result<Option<DateTime<Utc>>, QueryError> {
    match active(value) {
        None => Ok(None),
        Some(text) => DateTime::parse_from_rfc3339(text)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| QueryError::InvalidParameter {
                name,
                reason: e.to_string(),
            }),
    }
}

impl QueryRequest {
    /// Target store; an absent or empty `subscriber_type` selects ClickHouse.
    pub fn store_kind(&self) -> Result<StoreKind, QueryError> {
        match active(&self.subscriber_type).map(str::to_ascii_lowercase).as_deref() {
            None | Some("clickhouse") => Ok(StoreKind::Clickhouse),
            Some("file") => Ok(StoreKind::File),
            Some(other) => Err(QueryError::StoreUnavailable(other.to_string())),
        }
    }

    /// Translate into validated [`QueryParams`], clamping the context window.
    pub fn into_params(self) -> Result<QueryParams, QueryError> {
        let start = parse_time("start_time", &self.start_time)?;
        let end = parse_time("end_time", &self.end_time)?;
        let params = QueryParams {
            start,
            end,
            level: self.level,
            search: self.search,
            session_id: self.session_id,
            client_id: self.client_id,
            source: self.source,
            error: self.error,
            limit: self.limit.unwrap_or(0),
            window: ContextWindow::resolve(self.context, self.before_context, self.after_context),
        };
        params.validate()?;
        Ok(params)
    }
}

/// A persisted backend that answers filtered, optionally context-expanded
/// queries.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Run `params` against persisted data.
    ///
    /// Returns an empty vector when nothing matches. Cancellation of
    /// `cancel` surfaces as [`QueryError::Cancelled`]; a failed query never
    /// returns a partial result.
    async fn query(&self, cancel: &CancellationToken, params: &QueryParams) -> Result<Vec<LogRecord>, QueryError>;
}
