use crate::backend::DsnError;
use crate::columnar::{ColumnarClient, ColumnarRow, Order, Predicate, RowQuery, COLUMNS};
use crate::error::{QueryError, SinkError};
use crate::record::LogRecord;
use crate::sink::BatchSink;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Configuration for [`ClickHouseClient`] and [`ClickHouseSink`].
///
/// Both talk to ClickHouse over its HTTP interface using the
/// `JSONEachRow` format. The table is expected to expose the columns
/// listed in [`COLUMNS`] and to expire rows after its retention window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClickHouseConfig {
    /// Base URL without query, e.g. "http://127.0.0.1:8123"
    pub url: String,
    pub database: String,
    pub table: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        ClickHouseConfig {
            url: "http://127.0.0.1:8123".to_string(),
            database: "default".to_string(),
            table: "logs".to_string(),
            user: None,
            password: None,
        }
    }
}

impl ClickHouseConfig {
    /// Parse `clickhouse://[user[:password]@]host[:port][/database][?table=..&secure=true]`.
    ///
    /// The port defaults to 8123 (HTTP interface), the database to
    /// `default` and the table to `logs`.
    pub fn from_dsn(dsn: &str) -> Result<Self, DsnError> {
        let scheme = "clickhouse://";
        if !dsn.to_ascii_lowercase().starts_with(scheme) {
            return Err(DsnError::UnknownScheme);
        }
        let rest = &dsn[scheme.len()..];

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        let (userinfo, host) = match authority.rsplit_once('@') {
            Some((userinfo, host)) => (Some(userinfo), host),
            None => (None, authority),
        };
        if host.is_empty() {
            return Err(DsnError::MissingHost);
        }

        let mut config = ClickHouseConfig::default();
        let mut secure = false;
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            match pair.split_once('=') {
                Some(("table", table)) if !table.is_empty() => config.table = decode(table)?,
                Some(("secure", value)) => secure = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        let host = if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:8123")
        };
        config.url = format!("{}://{}", if secure { "https" } else { "http" }, host);

        let database = path.trim_matches('/');
        if !database.is_empty() {
            config.database = decode(database)?;
        }

        if let Some(userinfo) = userinfo {
            let (user, password) = match userinfo.split_once(':') {
                Some((user, password)) => (user, Some(password)),
                None => (userinfo, None),
            };
            if !user.is_empty() {
                config.user = Some(decode(user)?);
            }
            if let Some(password) = password.filter(|p| !p.is_empty()) {
                config.password = Some(decode(password)?);
            }
        }

        Ok(config)
    }

    fn auth_query(&self) -> String {
        let mut query = String::new();
        if let Some(user) = &self.user {
            query.push_str(&format!("&user={}", urlencoding::encode(user)));
        }
        if let Some(password) = &self.password {
            query.push_str(&format!("&password={}", urlencoding::encode(password)));
        }
        query
    }
}

fn decode(text: &str) -> Result<String, DsnError> {
    urlencoding::decode(text)
        .map(|s| s.into_owned())
        .map_err(|_| DsnError::InvalidEncoding)
}

/// A rendered SELECT: SQL text plus `param_<name>` bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedQuery {
    pub sql: String,
    pub params: Vec<(String, String)>,
}

/// Escape `value` for use inside an `ILIKE` pattern so it matches literally.
fn like_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Millisecond bound for an inclusive-from or exclusive-before test,
/// rounded up so sub-millisecond bounds admit no earlier row.
fn ceil_millis(t: &DateTime<Utc>) -> i64 {
    let millis = t.timestamp_millis();
    if t.timestamp_subsec_nanos() % 1_000_000 == 0 {
        millis
    } else {
        millis + 1
    }
}

/// Render `query` against `database.table` using server-side query
/// parameters, so filter values never become part of the SQL text.
pub fn render_select(database: &str, table: &str, query: &RowQuery) -> RenderedQuery {
    let mut params: Vec<(String, String)> = Vec::new();
    let mut bind = |value: String| {
        let name = format!("p{}", params.len());
        params.push((name.clone(), value));
        name
    };

    let mut conditions = Vec::with_capacity(query.predicates.len());
    for predicate in &query.predicates {
        let condition = match predicate {
            Predicate::TimeFrom(t) => {
                let p = bind(ceil_millis(t).to_string());
                format!("timestamp >= fromUnixTimestamp64Milli({{{p}:Int64}})")
            }
            Predicate::TimeUntil(t) => {
                let p = bind(t.timestamp_millis().to_string());
                format!("timestamp <= fromUnixTimestamp64Milli({{{p}:Int64}})")
            }
            Predicate::TimeBefore(t) => {
                let p = bind(ceil_millis(t).to_string());
                format!("timestamp < fromUnixTimestamp64Milli({{{p}:Int64}})")
            }
            Predicate::TimeAfter(t) => {
                let p = bind(t.timestamp_millis().to_string());
                format!("timestamp > fromUnixTimestamp64Milli({{{p}:Int64}})")
            }
            Predicate::Equals(column, value) => {
                let p = bind(value.clone());
                format!("{} = {{{p}:String}}", column.name())
            }
            Predicate::EqualsIgnoreCase(column, value) => {
                let p = bind(value.clone());
                format!("lowerUTF8({}) = lowerUTF8({{{p}:String}})", column.name())
            }
            Predicate::Contains(column, value) => {
                let p = bind(format!("%{}%", like_escape(value)));
                format!("{} ILIKE {{{p}:String}}", column.name())
            }
        };
        conditions.push(condition);
    }

    let select_list = COLUMNS
        .iter()
        .map(|c| {
            if *c == "timestamp" {
                "toUnixTimestamp64Milli(timestamp) AS timestamp_ms".to_string()
            } else {
                c.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    let filter = if conditions.is_empty() {
        "1 = 1".to_string()
    } else {
        conditions.join(" AND ")
    };
    let order = match query.order {
        Order::Ascending => "ASC",
        Order::Descending => "DESC",
    };

    RenderedQuery {
        sql: format!(
            "SELECT {select_list} FROM {database}.{table} WHERE {filter} ORDER BY timestamp {order}, sequence {order} LIMIT {} FORMAT JSONEachRow",
            query.limit
        ),
        params,
    }
}

/// Row as returned by [`render_select`]'s SELECT list.
#[derive(Deserialize)]
struct WireRow {
    timestamp_ms: i64,
    level: String,
    message: String,
    object: String,
    extra: String,
    logger_name: String,
    sequence: u64,
    error: String,
    stacktrace: String,
    session_id: String,
    client_id: String,
    source: String,
    client_ip: String,
}

impl WireRow {
    fn into_row(self) -> Result<ColumnarRow, QueryError> {
        let timestamp = Utc
            .timestamp_millis_opt(self.timestamp_ms)
            .single()
            .ok_or_else(|| QueryError::Storage(format!("timestamp out of range: {}", self.timestamp_ms)))?;
        Ok(ColumnarRow {
            timestamp,
            level: self.level,
            message: self.message,
            object: self.object,
            extra: self.extra,
            logger_name: self.logger_name,
            sequence: self.sequence,
            error: self.error,
            stacktrace: self.stacktrace,
            session_id: self.session_id,
            client_id: self.client_id,
            source: self.source,
            client_ip: self.client_ip,
        })
    }
}

/// Row as sent in `INSERT .. FORMAT JSONEachRow`.
#[derive(Serialize)]
struct InsertRow<'a> {
    timestamp: String,
    level: &'a str,
    message: &'a str,
    object: String,
    extra: String,
    logger_name: &'a str,
    sequence: u64,
    error: &'a str,
    stacktrace: &'a str,
    session_id: &'a str,
    client_id: &'a str,
    source: &'a str,
    client_ip: &'a str,
}

impl<'a> InsertRow<'a> {
    fn from_row(row: &'a ColumnarRow) -> Self {
        InsertRow {
            timestamp: row.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            level: &row.level,
            message: &row.message,
            object: row.object.clone(),
            extra: row.extra.clone(),
            logger_name: &row.logger_name,
            sequence: row.sequence,
            error: &row.error,
            stacktrace: &row.stacktrace,
            session_id: &row.session_id,
            client_id: &row.client_id,
            source: &row.source,
            client_ip: &row.client_ip,
        }
    }
}

/// ClickHouse implementation of [`ColumnarClient`] using the HTTP interface.
#[derive(Clone)]
pub struct ClickHouseClient {
    client: Client,
    config: ClickHouseConfig,
}

impl ClickHouseClient {
    /// Construct a new client instance using the provided configuration.
    ///
    /// No connection is made until the first request.
    pub fn new(config: ClickHouseConfig) -> Self {
        let client = Client::new();
        Self { client, config }
    }

    pub fn config(&self) -> &ClickHouseConfig {
        &self.config
    }

    fn insert_endpoint(&self) -> String {
        let query = format!(
            "database={}&query={}&date_time_input_format=best_effort{}",
            urlencoding::encode(&self.config.database),
            urlencoding::encode(&format!("INSERT INTO {} FORMAT JSONEachRow", self.config.table)),
            self.config.auth_query()
        );
        format!("{}/?{}", self.config.url, query)
    }

    fn select_endpoint(&self, params: &[(String, String)]) -> String {
        let mut query = format!(
            "database={}&output_format_json_quote_64bit_integers=0{}",
            urlencoding::encode(&self.config.database),
            self.config.auth_query()
        );
        for (name, value) in params {
            query.push_str(&format!("&param_{}={}", name, urlencoding::encode(value)));
        }
        format!("{}/?{}", self.config.url, query)
    }

    /// Validate that the target table exists and is readable.
    ///
    /// **Returns**
    /// - `Ok(())` if the `DESCRIBE TABLE` query succeeded.
    /// - `Err(SinkError::Connect(..))` on network failure or a
    ///   non-success status.
    pub async fn validate_schema(&self) -> Result<(), SinkError> {
        let sql = format!(
            "DESCRIBE TABLE {}.{} FORMAT JSON",
            self.config.database, self.config.table
        );
        let url = format!(
            "{}/?query={}{}",
            self.config.url,
            urlencoding::encode(&sql),
            self.config.auth_query()
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SinkError::Connect(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SinkError::Connect(format!(
                "ClickHouse schema validation failed with status {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Insert `rows` with a single `INSERT .. FORMAT JSONEachRow` request.
    pub async fn insert(&self, rows: &[ColumnarRow]) -> Result<(), SinkError> {
        let mut body = String::new();
        for row in rows {
            body.push_str(&serde_json::to_string(&InsertRow::from_row(row))?);
            body.push('\n');
        }

        let resp = self
            .client
            .post(self.insert_endpoint())
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Persist(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".to_string());
            Err(SinkError::Persist(format!(
                "ClickHouse insert failed with status {}: {}",
                status, text
            )))
        }
    }
}

#[async_trait]
impl ColumnarClient for ClickHouseClient {
    async fn select(&self, query: &RowQuery) -> Result<Vec<ColumnarRow>, QueryError> {
        let rendered = render_select(&self.config.database, &self.config.table, query);
        let resp = self
            .client
            .post(self.select_endpoint(&rendered.params))
            .body(rendered.sql)
            .send()
            .await
            .map_err(|e| QueryError::Storage(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| QueryError::Storage(e.to_string()))?;
        if !status.is_success() {
            return Err(QueryError::Storage(format!(
                "ClickHouse query failed with status {}: {}",
                status, text
            )));
        }

        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str::<WireRow>(line)
                    .map_err(|e| QueryError::Storage(format!("unreadable ClickHouse row: {e}")))
                    .and_then(WireRow::into_row)
            })
            .collect()
    }
}

/// ClickHouse implementation of [`BatchSink`]: one insert request per batch.
#[derive(Clone)]
pub struct ClickHouseSink {
    client: ClickHouseClient,
}

impl ClickHouseSink {
    pub fn new(config: ClickHouseConfig) -> Self {
        Self {
            client: ClickHouseClient::new(config),
        }
    }

    pub fn client(&self) -> &ClickHouseClient {
        &self.client
    }
}

#[async_trait]
impl BatchSink for ClickHouseSink {
    fn name(&self) -> &str {
        "clickhouse"
    }

    async fn connect(&self) -> Result<(), SinkError> {
        self.client.validate_schema().await
    }

    async fn persist(&self, batch: &[LogRecord]) -> Result<(), SinkError> {
        let rows: Vec<ColumnarRow> = batch.iter().map(ColumnarRow::from_record).collect();
        self.client.insert(&rows).await
    }
}
