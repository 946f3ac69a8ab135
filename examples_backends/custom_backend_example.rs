use std::sync::Arc;

use async_trait::async_trait;
use log_harbor::broker::MemoryBroker;
use log_harbor::error::SinkError;
use log_harbor::init::{init_tracing_with_broker, TracingConfig};
use log_harbor::record::LogRecord;
use log_harbor::sink::{BatchSink, RunnerConfig, SinkRunner};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Example of integrating a completely custom backend by implementing
/// the `BatchSink` trait directly. Imagine this talks to some
/// proprietary DB for which this crate does not provide a built-in
/// sink.
struct MyCustomDbSink;

#[async_trait]
impl BatchSink for MyCustomDbSink {
    fn name(&self) -> &str {
        "my-custom-db"
    }

    async fn persist(&self, batch: &[LogRecord]) -> Result<(), SinkError> {
        // Here you would call your own client library for the target DB.
        // For the sake of example we just print the records.
        for record in batch {
            println!("[my-custom-db] {}", serde_json::to_string(record)?);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let broker = Arc::new(MemoryBroker::new());
    init_tracing_with_broker(Arc::clone(&broker), &TracingConfig::default()).expect("init tracing");

    let cancel = CancellationToken::new();
    let runner = SinkRunner::new(Arc::new(MyCustomDbSink), RunnerConfig::default());
    let task = {
        let broker = Arc::clone(&broker);
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run(broker.as_ref(), &cancel).await })
    };
    while broker.stats().subscribers == 0 {
        sleep(Duration::from_millis(1)).await;
    }

    info!("custom backend example started");
    error!(db = "my-custom-db", "simulated error sent via custom backend");

    sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let _ = task.await;
}
