use crate::broker::{Batch, Subscriber};
use crate::error::SinkError;
use crate::record::LogRecord;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Asynchronous destination for batches drained from a broker subscription.
///
/// Implementations are responsible for transporting records to a concrete
/// backend (files, ClickHouse, an in-memory table). The [`SinkRunner`]
/// calls `persist` from its own task and never retries a failed batch.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Short name used in log fields.
    fn name(&self) -> &str;

    /// Establish or verify connectivity with the backend.
    ///
    /// **Returns**
    /// - `Ok(())` once the backend is reachable.
    /// - `Err(SinkError::Connect(..))` if it is not; the runner retries
    ///   according to its [`RunnerConfig`].
    ///
    /// Default implementation is a no-op for local sinks.
    async fn connect(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Persist one batch, in order.
    ///
    /// **Parameters**
    /// - `batch`: records exactly as published; timestamps are always set.
    ///
    /// **Returns**
    /// - `Ok(())` if the backend accepted every record.
    /// - `Err(..)` otherwise. The batch is abandoned by the runner.
    async fn persist(&self, batch: &[LogRecord]) -> Result<(), SinkError>;
}

#[async_trait]
impl<T: BatchSink + ?Sized> BatchSink for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn connect(&self) -> Result<(), SinkError> {
        (**self).connect().await
    }

    async fn persist(&self, batch: &[LogRecord]) -> Result<(), SinkError> {
        (**self).persist(batch).await
    }
}

/// Retry and timeout policy of a [`SinkRunner`].
///
/// **Fields**
/// - `connect_retry_delay`: fixed pause between connection attempts.
/// - `max_connect_attempts`: `None` retries until cancelled.
/// - `batch_timeout`: upper bound on a single `persist` call.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub connect_retry_delay: Duration,
    pub max_connect_attempts: Option<u32>,
    pub batch_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            connect_retry_delay: Duration::from_secs(5),
            max_connect_attempts: None,
            batch_timeout: Duration::from_secs(10),
        }
    }
}

/// Counters of a finished runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerReport {
    pub persisted_batches: u64,
    pub failed_batches: u64,
}

/// Single-task pull loop: connect, subscribe, then persist every batch.
pub struct SinkRunner {
    sink: Arc<dyn BatchSink>,
    config: RunnerConfig,
}

impl SinkRunner {
    pub fn new(sink: Arc<dyn BatchSink>, config: RunnerConfig) -> Self {
        Self { sink, config }
    }

    /// Drive the sink until `cancel` fires or the broker goes away.
    ///
    /// The subscription is taken only after the backend is reachable, so
    /// batches published while connecting are not queued for this sink.
    ///
    /// **Returns**
    /// - `Ok(report)` when the subscription closes.
    /// - `Err(SinkError::Cancelled)` when `cancel` fires.
    /// - `Err(SinkError::ConnectExhausted { .. })` when the attempt budget
    ///   runs out.
    pub async fn run(
        &self,
        subscriber: &dyn Subscriber,
        cancel: &CancellationToken,
    ) -> Result<RunnerReport, SinkError> {
        let name = self.sink.name().to_string();
        tracing::info!(sink = %name, "starting sink");

        self.connect_with_retry(cancel).await?;

        let mut subscription = subscriber.subscribe(cancel)?;
        let mut report = RunnerReport::default();

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => return Err(SinkError::Cancelled),
                next = subscription.recv() => match next {
                    Some(batch) => batch,
                    None => {
                        tracing::info!(sink = %name, "subscription closed");
                        return Ok(report);
                    }
                },
            };

            match self.persist_batch(&batch, cancel).await {
                Ok(()) => report.persisted_batches += 1,
                Err(SinkError::Cancelled) => return Err(SinkError::Cancelled),
                Err(e) => {
                    report.failed_batches += 1;
                    tracing::error!(
                        sink = %name,
                        records = batch.len(),
                        error = %e,
                        label = e.as_label(),
                        "batch abandoned"
                    );
                }
            }
        }
    }

    async fn connect_with_retry(&self, cancel: &CancellationToken) -> Result<(), SinkError> {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(SinkError::Cancelled);
            }
            attempt += 1;

            let err = match self.sink.connect().await {
                Ok(()) => {
                    tracing::info!(sink = %self.sink.name(), attempt, "sink connected");
                    return Ok(());
                }
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            if let Some(max) = self.config.max_connect_attempts {
                if attempt >= max {
                    return Err(SinkError::ConnectExhausted {
                        attempts: attempt,
                        last: err.to_string(),
                    });
                }
            }

            tracing::warn!(
                sink = %self.sink.name(),
                attempt,
                error = %err,
                "connection failed, retrying in {:?}",
                self.config.connect_retry_delay
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(SinkError::Cancelled),
                _ = tokio::time::sleep(self.config.connect_retry_delay) => {}
            }
        }
    }

    async fn persist_batch(&self, batch: &Batch, cancel: &CancellationToken) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let started = std::time::Instant::now();
        let timeout = self.config.batch_timeout;

        tokio::select! {
            _ = cancel.cancelled() => Err(SinkError::Cancelled),
            res = tokio::time::timeout(timeout, self.sink.persist(batch)) => match res {
                Ok(Ok(())) => {
                    tracing::debug!(
                        sink = %self.sink.name(),
                        records = batch.len(),
                        elapsed = ?started.elapsed(),
                        "batch persisted"
                    );
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(_elapsed) => Err(SinkError::Timeout { timeout }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Publisher};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<usize>>,
        fail_connects: AtomicU32,
        connects: AtomicU32,
        stall: bool,
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn connect(&self) -> Result<(), SinkError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connects.load(Ordering::SeqCst) > 0 {
                self.fail_connects.fetch_sub(1, Ordering::SeqCst);
                return Err(SinkError::Connect("refused".into()));
            }
            Ok(())
        }

        async fn persist(&self, batch: &[LogRecord]) -> Result<(), SinkError> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            self.batches.lock().unwrap().push(batch.len());
            Ok(())
        }
    }

    fn fast_config() -> RunnerConfig {
        RunnerConfig {
            connect_retry_delay: Duration::from_millis(5),
            max_connect_attempts: Some(3),
            batch_timeout: Duration::from_millis(50),
        }
    }

    fn records(n: usize) -> Vec<LogRecord> {
        (0..n).map(|i| LogRecord::new(format!("m{i}"), Utc::now())).collect()
    }

    async fn wait_for_subscriber(broker: &MemoryBroker) {
        for _ in 0..200 {
            if broker.stats().subscribers > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("runner never subscribed");
    }

    #[tokio::test]
    async fn runner_persists_batches_until_cancelled() {
        let broker = Arc::new(MemoryBroker::new());
        let sink = Arc::new(RecordingSink::default());
        let runner = SinkRunner::new(sink.clone(), fast_config());
        let cancel = CancellationToken::new();

        let task = {
            let broker = Arc::clone(&broker);
            let cancel = cancel.clone();
            tokio::spawn(async move { runner.run(broker.as_ref(), &cancel).await })
        };
        wait_for_subscriber(&broker).await;

        broker.publish(&cancel, records(3)).unwrap();
        broker.publish(&cancel, records(1)).unwrap();
        for _ in 0..200 {
            if sink.batches.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(SinkError::Cancelled)));
        assert_eq!(*sink.batches.lock().unwrap(), vec![3, 1]);
    }

    #[tokio::test]
    async fn connection_failures_are_retried() {
        let broker = MemoryBroker::new();
        let sink = Arc::new(RecordingSink {
            fail_connects: AtomicU32::new(2),
            ..Default::default()
        });
        let runner = SinkRunner::new(sink.clone(), fast_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        // Cancelled before the first attempt.
        assert!(matches!(runner.run(&broker, &cancel).await, Err(SinkError::Cancelled)));
        assert_eq!(sink.connects.load(Ordering::SeqCst), 0);

        let cancel = CancellationToken::new();
        runner.connect_with_retry(&cancel).await.unwrap();
        assert_eq!(sink.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn connection_attempts_are_bounded() {
        let broker = MemoryBroker::new();
        let sink = Arc::new(RecordingSink {
            fail_connects: AtomicU32::new(10),
            ..Default::default()
        });
        let runner = SinkRunner::new(sink.clone(), fast_config());

        let err = runner.run(&broker, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SinkError::ConnectExhausted { attempts: 3, .. }));
        assert_eq!(broker.stats().subscribers, 0);
    }

    #[tokio::test]
    async fn stalled_persist_times_out_and_loop_continues() {
        let sink = Arc::new(RecordingSink {
            stall: true,
            ..Default::default()
        });
        let runner = SinkRunner::new(sink, fast_config());
        let batch: Batch = Batch::from(records(2));

        let err = runner
            .persist_batch(&batch, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Timeout { .. }));
    }

    #[tokio::test]
    async fn runner_returns_when_subscription_closes() {
        let broker = MemoryBroker::new();
        let sink = Arc::new(RecordingSink::default());
        let runner = SinkRunner::new(sink, fast_config());
        let cancel = CancellationToken::new();

        let run = runner.run(&broker, &cancel);
        tokio::pin!(run);
        // Let the runner subscribe, then release its queue.
        tokio::select! {
            _ = &mut run => panic!("runner finished early"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
        assert!(broker.deregister(0));

        let report = run.await.unwrap();
        assert_eq!(report, RunnerReport::default());
    }
}
