use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;
use chrono::Utc;
use log_harbor::broker::{MemoryBroker, Publisher};
use log_harbor::error::SinkError;
use log_harbor::record::LogRecord;
use log_harbor::sink::{BatchSink, RunnerConfig, SinkRunner};

/// Sink that takes a fixed time per batch, standing in for a slow backend.
struct SlowSink {
    delay: Duration,
}

#[async_trait]
impl BatchSink for SlowSink {
    fn name(&self) -> &str {
        "slow"
    }

    async fn persist(&self, _batch: &[LogRecord]) -> Result<(), SinkError> {
        sleep(self.delay).await;
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    // Small queue so the burst overflows it.
    let broker = Arc::new(MemoryBroker::with_capacity(64));
    let cancel = CancellationToken::new();

    let config = RunnerConfig {
        batch_timeout: Duration::from_millis(200),
        ..RunnerConfig::default()
    };
    let runner = SinkRunner::new(
        Arc::new(SlowSink {
            delay: Duration::from_millis(2),
        }),
        config,
    );
    let task = {
        let broker = Arc::clone(&broker);
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run(broker.as_ref(), &cancel).await })
    };
    while broker.stats().subscribers == 0 {
        sleep(Duration::from_millis(1)).await;
    }

    let n: u64 = 5_000;
    let start = Instant::now();
    for i in 0..n {
        let record = LogRecord::new("burst load test record", Utc::now()).with_sequence(i);
        if broker.publish(&cancel, vec![record]).is_err() {
            break;
        }
    }

    let elapsed = start.elapsed();
    println!(
        "burst: published {} single-record batches in {:?} (~{:.0} batch/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    let stats = broker.stats();
    println!(
        "ingested={} dropped={} (queue capacity {})",
        stats.ingested,
        stats.dropped,
        broker.capacity()
    );

    cancel.cancel();
    let _ = task.await;
}
