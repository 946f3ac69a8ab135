use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use chrono::Utc;
use log_harbor::broker::{MemoryBroker, Publisher};
use log_harbor::noop_sink::NoopSink;
use log_harbor::record::LogRecord;
use log_harbor::sink::{RunnerConfig, SinkRunner};

#[tokio::main]
async fn main() {
    let broker = Arc::new(MemoryBroker::new());
    let sink = Arc::new(NoopSink::new());
    let cancel = CancellationToken::new();

    let runner = SinkRunner::new(sink.clone(), RunnerConfig::default());
    let task = {
        let broker = Arc::clone(&broker);
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run(broker.as_ref(), &cancel).await })
    };
    while broker.stats().subscribers == 0 {
        sleep(Duration::from_millis(1)).await;
    }

    let batches: u64 = 10_000;
    let batch_size: u64 = 10;
    let start = Instant::now();

    for i in 0..batches {
        let batch = (0..batch_size)
            .map(|j| LogRecord::new("default load test record", Utc::now()).with_sequence(i * batch_size + j))
            .collect();
        if broker.publish(&cancel, batch).is_err() {
            break;
        }
        if i % 100 == 0 {
            tokio::task::yield_now().await;
        }
    }

    let elapsed = start.elapsed();
    let records = batches * batch_size;
    println!(
        "publish: sent {} records in {:?} (~{:.0} rec/s)",
        records,
        elapsed,
        records as f64 / elapsed.as_secs_f64()
    );

    // Give the runner a little time to drain its queue
    sleep(Duration::from_secs(1)).await;
    let stats = broker.stats();
    println!(
        "ingested={} dropped={} persisted={}",
        stats.ingested,
        stats.dropped,
        sink.records()
    );

    cancel.cancel();
    let _ = task.await;
}
