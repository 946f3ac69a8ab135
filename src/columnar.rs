//! Query engine over a columnar log table.
//!
//! [`ColumnarStore`] is written against the [`ColumnarClient`] trait,
//! which executes a structured [`RowQuery`]. The ClickHouse client
//! renders it to SQL; [`MemoryTable`] evaluates it in process.
//!
//! Rows expire after the table's retention window, so neighbour lookups
//! simply return fewer rows at the edge of the retained data.

use crate::error::{QueryError, SinkError};
use crate::query::{contains_ignore_case, eq_ignore_case, LogStore, QueryParams};
use crate::record::{fields_to_text, parse_fields, Level, LogRecord};
use crate::sink::BatchSink;
use crate::window::{expand_anchors, NeighborLookup};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

/// Columns in table order.
pub const COLUMNS: [&str; 13] = [
    "timestamp",
    "level",
    "message",
    "object",
    "extra",
    "logger_name",
    "sequence",
    "error",
    "stacktrace",
    "session_id",
    "client_id",
    "source",
    "client_ip",
];

/// One row of the log table. Structured fields are stored as JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnarRow {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub object: String,
    pub extra: String,
    pub logger_name: String,
    pub sequence: u64,
    pub error: String,
    pub stacktrace: String,
    pub session_id: String,
    pub client_id: String,
    pub source: String,
    pub client_ip: String,
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

impl ColumnarRow {
    pub fn from_record(record: &LogRecord) -> Self {
        ColumnarRow {
            timestamp: record.time,
            level: record.level.as_str().to_string(),
            message: record.message.clone(),
            object: fields_to_text(&record.object),
            extra: fields_to_text(&record.extra),
            logger_name: record.logger_name.clone(),
            sequence: record.sequence,
            error: record.error.clone().unwrap_or_default(),
            stacktrace: record.stacktrace.clone().unwrap_or_default(),
            session_id: record.session_id.clone(),
            client_id: record.client_id.clone(),
            source: record.source.clone(),
            client_ip: record.client_ip.clone().unwrap_or_default(),
        }
    }

    /// Convert back into a record. Unparsable structured text becomes an
    /// empty map and an unknown level becomes the default level.
    pub fn into_record(self) -> LogRecord {
        LogRecord {
            level: self.level.parse::<Level>().unwrap_or_default(),
            message: self.message,
            object: parse_fields(&self.object),
            extra: parse_fields(&self.extra),
            logger_name: self.logger_name,
            time: self.timestamp,
            sequence: self.sequence,
            error: non_empty(self.error),
            stacktrace: non_empty(self.stacktrace),
            session_id: self.session_id,
            client_id: self.client_id,
            source: self.source,
            client_ip: non_empty(self.client_ip),
        }
    }
}

/// Text columns a [`Predicate`] can test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Level,
    Message,
    SessionId,
    ClientId,
    Source,
    Error,
}

impl Column {
    pub fn name(&self) -> &'static str {
        match self {
            Column::Level => "level",
            Column::Message => "message",
            Column::SessionId => "session_id",
            Column::ClientId => "client_id",
            Column::Source => "source",
            Column::Error => "error",
        }
    }

    pub fn value<'a>(&self, row: &'a ColumnarRow) -> &'a str {
        match self {
            Column::Level => &row.level,
            Column::Message => &row.message,
            Column::SessionId => &row.session_id,
            Column::ClientId => &row.client_id,
            Column::Source => &row.source,
            Column::Error => &row.error,
        }
    }
}

/// A single condition of a [`RowQuery`]; all conditions must hold.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `timestamp >= t`
    TimeFrom(DateTime<Utc>),
    /// `timestamp <= t`
    TimeUntil(DateTime<Utc>),
    /// `timestamp < t`
    TimeBefore(DateTime<Utc>),
    /// `timestamp > t`
    TimeAfter(DateTime<Utc>),
    /// Exact, case-sensitive equality.
    Equals(Column, String),
    EqualsIgnoreCase(Column, String),
    /// Case-insensitive substring.
    Contains(Column, String),
}

impl Predicate {
    pub fn eval(&self, row: &ColumnarRow) -> bool {
        match self {
            Predicate::TimeFrom(t) => row.timestamp >= *t,
            Predicate::TimeUntil(t) => row.timestamp <= *t,
            Predicate::TimeBefore(t) => row.timestamp < *t,
            Predicate::TimeAfter(t) => row.timestamp > *t,
            Predicate::Equals(column, value) => column.value(row) == value,
            Predicate::EqualsIgnoreCase(column, value) => eq_ignore_case(column.value(row), value),
            Predicate::Contains(column, value) => contains_ignore_case(column.value(row), value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Oldest first.
    Ascending,
    /// Newest first.
    Descending,
}

/// Filtered, time-ordered, limited selection of rows.
#[derive(Debug, Clone, PartialEq)]
pub struct RowQuery {
    pub predicates: Vec<Predicate>,
    pub order: Order,
    pub limit: usize,
}

impl RowQuery {
    /// The primary query for `params`: every filter, newest first.
    pub fn primary(params: &QueryParams) -> Self {
        let mut predicates = Vec::new();
        if let Some(start) = params.start {
            predicates.push(Predicate::TimeFrom(start));
        }
        if let Some(end) = params.end {
            predicates.push(Predicate::TimeUntil(end));
        }
        if let Some(level) = params.level_filter() {
            predicates.push(Predicate::EqualsIgnoreCase(Column::Level, level.to_string()));
        }
        if let Some(search) = params.search_filter() {
            predicates.push(Predicate::Contains(Column::Message, search.to_string()));
        }
        if let Some(session) = params.session_filter() {
            predicates.push(Predicate::EqualsIgnoreCase(Column::SessionId, session.to_string()));
        }
        if let Some(client) = params.client_filter() {
            predicates.push(Predicate::EqualsIgnoreCase(Column::ClientId, client.to_string()));
        }
        if let Some(source) = params.source_filter() {
            predicates.push(Predicate::Contains(Column::Source, source.to_string()));
        }
        if let Some(error) = params.error_filter() {
            predicates.push(Predicate::Contains(Column::Error, error.to_string()));
        }

        RowQuery {
            predicates,
            order: Order::Descending,
            limit: params.effective_limit(),
        }
    }

    pub fn matches(&self, row: &ColumnarRow) -> bool {
        self.predicates.iter().all(|p| p.eval(row))
    }
}

/// Executes [`RowQuery`]s against a columnar table.
///
/// Implementations must be safe for concurrent read use.
#[async_trait]
pub trait ColumnarClient: Send + Sync {
    async fn select(&self, query: &RowQuery) -> Result<Vec<ColumnarRow>, QueryError>;
}

#[async_trait]
impl<T: ColumnarClient + ?Sized> ColumnarClient for Arc<T> {
    async fn select(&self, query: &RowQuery) -> Result<Vec<ColumnarRow>, QueryError> {
        (**self).select(query).await
    }
}

/// [`LogStore`] over a [`ColumnarClient`].
pub struct ColumnarStore<C> {
    client: C,
}

impl<C: ColumnarClient> ColumnarStore<C> {
    pub fn new(client: C) -> Self {
        ColumnarStore { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Run one query, aborting promptly if `cancel` fires.
    async fn fetch(&self, cancel: &CancellationToken, query: &RowQuery) -> Result<Vec<LogRecord>, QueryError> {
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        let rows = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueryError::Cancelled),
            rows = self.client.select(query) => rows?,
        };
        Ok(rows.into_iter().map(ColumnarRow::into_record).collect())
    }
}

/// Neighbour lookups confined to an anchor's session and/or client.
struct ScopedNeighbors<'a, C> {
    store: &'a ColumnarStore<C>,
    cancel: &'a CancellationToken,
    by_session: bool,
    by_client: bool,
}

impl<'a, C> ScopedNeighbors<'a, C> {
    fn scope(&self, anchor: &LogRecord) -> Vec<Predicate> {
        let mut predicates = Vec::with_capacity(3);
        if self.by_session {
            predicates.push(Predicate::Equals(Column::SessionId, anchor.session_id.clone()));
        }
        if self.by_client {
            predicates.push(Predicate::Equals(Column::ClientId, anchor.client_id.clone()));
        }
        predicates
    }
}

#[async_trait]
impl<'a, C: ColumnarClient> NeighborLookup for ScopedNeighbors<'a, C> {
    async fn before(&self, anchor: &LogRecord, count: usize) -> Result<Vec<LogRecord>, QueryError> {
        let mut predicates = self.scope(anchor);
        predicates.push(Predicate::TimeBefore(anchor.time));
        let query = RowQuery {
            predicates,
            order: Order::Descending,
            limit: count,
        };
        let mut records = self.store.fetch(self.cancel, &query).await?;
        records.reverse();
        Ok(records)
    }

    async fn after(&self, anchor: &LogRecord, count: usize) -> Result<Vec<LogRecord>, QueryError> {
        let mut predicates = self.scope(anchor);
        predicates.push(Predicate::TimeAfter(anchor.time));
        let query = RowQuery {
            predicates,
            order: Order::Ascending,
            limit: count,
        };
        self.store.fetch(self.cancel, &query).await
    }
}

#[async_trait]
impl<C: ColumnarClient> LogStore for ColumnarStore<C> {
    async fn query(&self, cancel: &CancellationToken, params: &QueryParams) -> Result<Vec<LogRecord>, QueryError> {
        params.validate()?;

        let anchors = self.fetch(cancel, &RowQuery::primary(params)).await?;
        if params.window.is_empty() || anchors.is_empty() {
            return Ok(anchors);
        }

        let lookup = ScopedNeighbors {
            store: self,
            cancel,
            by_session: params.session_filter().is_some(),
            by_client: params.client_filter().is_some(),
        };
        expand_anchors(&lookup, anchors, params.window).await
    }
}

/// In-process columnar table.
///
/// Serves as a [`ColumnarClient`] for queries and as a [`BatchSink`] for
/// persistence, so the whole pipeline can run without an external store.
#[derive(Debug, Default)]
pub struct MemoryTable {
    rows: RwLock<Vec<ColumnarRow>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_rows(&self, rows: impl IntoIterator<Item = ColumnarRow>) {
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(rows);
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ColumnarClient for MemoryTable {
    async fn select(&self, query: &RowQuery) -> Result<Vec<ColumnarRow>, QueryError> {
        let mut selected: Vec<ColumnarRow> = self
            .rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|row| query.matches(row))
            .cloned()
            .collect();

        // Same keys as the rendered SQL: timestamp, then sequence.
        let key = |row: &ColumnarRow| (row.timestamp, row.sequence);
        match query.order {
            Order::Ascending => selected.sort_by_key(key),
            Order::Descending => selected.sort_by(|a, b| key(b).cmp(&key(a))),
        }
        selected.truncate(query.limit);
        Ok(selected)
    }
}

#[async_trait]
impl BatchSink for MemoryTable {
    fn name(&self) -> &str {
        "memory"
    }

    async fn persist(&self, batch: &[LogRecord]) -> Result<(), SinkError> {
        self.insert_rows(batch.iter().map(ColumnarRow::from_record));
        Ok(())
    }
}
