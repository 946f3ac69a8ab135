use crate::error::SinkError;
use crate::record::LogRecord;
use crate::sink::BatchSink;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// A sink that accepts and discards every batch.
///
/// Useful for measuring broker and runner overhead without any external
/// I/O, and for tests that don't care about persistence.
#[derive(Debug, Default)]
pub struct NoopSink {
    records: AtomicU64,
}

impl NoopSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records accepted so far.
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BatchSink for NoopSink {
    fn name(&self) -> &str {
        "noop"
    }

    async fn persist(&self, batch: &[LogRecord]) -> Result<(), SinkError> {
        self.records.fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn counts_and_discards() {
        let sink = NoopSink::new();
        sink.connect().await.unwrap();
        sink.persist(&[LogRecord::new("a", Utc::now()), LogRecord::new("b", Utc::now())])
            .await
            .unwrap();
        assert_eq!(sink.records(), 2);
    }
}
