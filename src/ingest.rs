//! Turning authenticated client payloads into broker batches.

use crate::auth::{AuthError, KeyVerifier};
use crate::broker::{BrokerStats, Publisher};
use crate::error::BrokerError;
use crate::record::{Fields, Level, LogRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// One record as submitted by a client.
///
/// `level` and `time` may be omitted; they default to INFO and the
/// arrival time. `client_ip` is never taken from the payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IngestRecord {
    pub level: Option<Level>,
    pub message: String,
    pub object: Option<Fields>,
    pub extra: Option<Fields>,
    pub logger_name: String,
    pub time: Option<DateTime<Utc>>,
    pub sequence: u64,
    pub error: Option<String>,
    pub stacktrace: Option<String>,
    pub session_id: String,
    pub client_id: String,
    pub source: String,
}

impl IngestRecord {
    /// Fill defaults and attach the caller's address.
    pub fn into_record(self, client_ip: Option<&str>, now: DateTime<Utc>) -> LogRecord {
        LogRecord {
            level: self.level.unwrap_or_default(),
            message: self.message,
            object: self.object,
            extra: self.extra,
            logger_name: self.logger_name,
            time: self.time.unwrap_or(now),
            sequence: self.sequence,
            error: self.error.filter(|e| !e.is_empty()),
            stacktrace: self.stacktrace.filter(|s| !s.is_empty()),
            session_id: self.session_id,
            client_id: self.client_id,
            source: self.source,
            client_ip: client_ip.filter(|ip| !ip.is_empty()).map(str::to_string),
        }
    }
}

/// Errors returned by [`Ingestor`]. Each maps to one client-facing outcome.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error("missing api key")]
    MissingApiKey,

    #[error("invalid api key: {0}")]
    Unauthorized(#[source] AuthError),

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("failed to ingest logs: {0}")]
    Publish(#[from] BrokerError),
}

impl IngestError {
    pub fn as_label(&self) -> &'static str {
        match self {
            IngestError::MissingApiKey => "ingest_missing_api_key",
            IngestError::Unauthorized(_) => "ingest_unauthorized",
            IngestError::InvalidPayload(_) => "ingest_invalid_payload",
            IngestError::Publish(_) => "ingest_publish",
        }
    }
}

/// Decode a request body holding a JSON array of records.
pub fn decode_batch(body: &[u8]) -> Result<Vec<IngestRecord>, IngestError> {
    Ok(serde_json::from_slice(body)?)
}

/// Service health snapshot, serialized as
/// `{"status","uptime","ingested_logs","dropped_logs"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub status: &'static str,
    /// Whole seconds since the ingestor was created.
    #[serde(rename = "uptime")]
    pub uptime_secs: u64,
    #[serde(rename = "ingested_logs")]
    pub ingested: u64,
    #[serde(rename = "dropped_logs")]
    pub dropped: u64,
}

impl StatusReport {
    pub fn new(uptime: Duration, stats: BrokerStats) -> Self {
        Self {
            status: "ok",
            uptime_secs: uptime.as_secs(),
            ingested: stats.ingested,
            dropped: stats.dropped,
        }
    }
}

/// Front door of the broker: authenticate, normalize, publish.
pub struct Ingestor<P, V> {
    publisher: P,
    verifier: V,
    started: Instant,
}

impl<P: Publisher, V: KeyVerifier> Ingestor<P, V> {
    pub fn new(publisher: P, verifier: V) -> Self {
        Self {
            publisher,
            verifier,
            started: Instant::now(),
        }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    fn authenticate(&self, api_key: Option<&str>) -> Result<String, IngestError> {
        let key = api_key.filter(|k| !k.is_empty()).ok_or(IngestError::MissingApiKey)?;
        self.verifier.verify(key).map_err(IngestError::Unauthorized)
    }

    /// Authenticate, normalize and publish `records` as one batch.
    ///
    /// **Returns**
    /// - `Ok(n)` with the number of records handed to the broker.
    /// - `Err(IngestError::MissingApiKey | Unauthorized)` before anything
    ///   is published.
    /// - `Err(IngestError::Publish(..))` if `cancel` fired.
    pub fn ingest(
        &self,
        cancel: &CancellationToken,
        api_key: Option<&str>,
        client_ip: Option<&str>,
        records: Vec<IngestRecord>,
    ) -> Result<usize, IngestError> {
        let client = self.authenticate(api_key)?;
        self.publish(cancel, &client, client_ip, records)
    }

    /// Like [`ingest`](Self::ingest) but decodes a raw JSON body first.
    /// The key is checked before the body is parsed.
    pub fn ingest_body(
        &self,
        cancel: &CancellationToken,
        api_key: Option<&str>,
        client_ip: Option<&str>,
        body: &[u8],
    ) -> Result<usize, IngestError> {
        let client = self.authenticate(api_key)?;
        let records = decode_batch(body)?;
        self.publish(cancel, &client, client_ip, records)
    }

    fn publish(
        &self,
        cancel: &CancellationToken,
        client: &str,
        client_ip: Option<&str>,
        records: Vec<IngestRecord>,
    ) -> Result<usize, IngestError> {
        let now = Utc::now();
        let batch: Vec<LogRecord> = records
            .into_iter()
            .map(|r| r.into_record(client_ip, now))
            .collect();
        let count = batch.len();
        self.publisher.publish(cancel, batch)?;
        tracing::debug!(client = %client, records = count, "batch accepted");
        Ok(count)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

impl<V: KeyVerifier> Ingestor<std::sync::Arc<crate::broker::MemoryBroker>, V> {
    /// Health snapshot backed by the broker's counters.
    pub fn status(&self) -> StatusReport {
        StatusReport::new(self.uptime(), self.publisher.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::HmacKeyVerifier;
    use crate::broker::MemoryBroker;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn setup() -> (Ingestor<Arc<MemoryBroker>, HmacKeyVerifier>, String) {
        let verifier = HmacKeyVerifier::new("secret");
        let key = verifier.issue("web").unwrap();
        (Ingestor::new(Arc::new(MemoryBroker::new()), verifier), key)
    }

    #[test]
    fn defaults_are_filled_on_conversion() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let record: IngestRecord = serde_json::from_str(r#"{"message":"hi","session_id":"s1"}"#).unwrap();
        let record = record.into_record(Some("10.1.2.3"), now);
        assert_eq!(record.level, Level::Info);
        assert_eq!(record.time, now);
        assert_eq!(record.client_ip.as_deref(), Some("10.1.2.3"));

        let explicit: IngestRecord =
            serde_json::from_str(r#"{"message":"x","level":"SEVERE","time":"2024-01-01T00:00:00Z","client_ip":"1.1.1.1"}"#)
                .unwrap();
        let explicit = explicit.into_record(None, now);
        assert_eq!(explicit.level, Level::Severe);
        assert_eq!(explicit.time, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(explicit.client_ip, None);
    }

    #[test]
    fn body_is_published_as_one_batch() {
        let (ingestor, key) = setup();
        let mut sub = ingestor
            .publisher()
            .register(&CancellationToken::new())
            .unwrap();

        let body = br#"[{"message":"a"},{"message":"b","level":"WARNING"}]"#;
        let n = ingestor
            .ingest_body(&CancellationToken::new(), Some(&key), Some("10.0.0.9"), body)
            .unwrap();
        assert_eq!(n, 2);

        let batch = sub.try_recv().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].level, Level::Warning);
        assert_eq!(batch[0].client_ip.as_deref(), Some("10.0.0.9"));

        let status = ingestor.status();
        assert_eq!(status.status, "ok");
        assert_eq!(status.ingested, 2);
        assert_eq!(status.dropped, 0);
    }

    #[test]
    fn status_report_uses_wire_names() {
        let stats = BrokerStats {
            ingested: 7,
            dropped: 2,
            subscribers: 1,
        };
        let json = serde_json::to_value(StatusReport::new(Duration::from_secs(90), stats)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "ok", "uptime": 90, "ingested_logs": 7, "dropped_logs": 2})
        );
    }

    #[test]
    fn auth_is_checked_before_payload() {
        let (ingestor, key) = setup();
        let cancel = CancellationToken::new();

        let err = ingestor.ingest_body(&cancel, None, None, b"not json").unwrap_err();
        assert_eq!(err.as_label(), "ingest_missing_api_key");

        let err = ingestor.ingest_body(&cancel, Some("web.bogus"), None, b"not json").unwrap_err();
        assert_eq!(err.as_label(), "ingest_unauthorized");

        let err = ingestor.ingest_body(&cancel, Some(&key), None, b"not json").unwrap_err();
        assert_eq!(err.as_label(), "ingest_invalid_payload");
        assert_eq!(ingestor.status().ingested, 0);
    }

    #[test]
    fn unknown_level_is_an_invalid_payload() {
        let err = decode_batch(br#"[{"message":"a","level":"LOUD"}]"#).unwrap_err();
        assert!(matches!(err, IngestError::InvalidPayload(_)));
    }

    #[test]
    fn cancelled_publish_is_reported() {
        let (ingestor, key) = setup();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = ingestor
            .ingest(&cancel, Some(&key), None, vec![IngestRecord::default()])
            .unwrap_err();
        assert!(matches!(err, IngestError::Publish(BrokerError::Cancelled)));
    }
}
