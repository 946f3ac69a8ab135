use std::sync::Arc;

use chrono::Utc;
use log_harbor::backend::{make_sink_from_config, parse_dsn, StoreRouter};
use log_harbor::broker::MemoryBroker;
use log_harbor::init::{init_tracing_with_broker, TracingConfig};
use log_harbor::query::QueryRequest;
use log_harbor::record::LogRecord;
use log_harbor::sink::{RunnerConfig, SinkRunner};
use log_harbor::Publisher;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Example DSN: file:///var/log/harbor
    let dsn = std::env::var("LOG_HARBOR_FILE_DSN").unwrap_or_else(|_| "file://./harbor-logs".to_string());

    let broker = Arc::new(MemoryBroker::new());
    if let Err(e) = init_tracing_with_broker(Arc::clone(&broker), &TracingConfig::default()) {
        eprintln!("tracing already initialised: {e}");
    }

    let backend_cfg = parse_dsn(&dsn).expect("invalid LOG_HARBOR_FILE_DSN");
    let sink = make_sink_from_config(&backend_cfg).expect("failed to build file sink");

    let cancel = CancellationToken::new();
    let runner = SinkRunner::new(sink, RunnerConfig::default());
    let task = {
        let broker = Arc::clone(&broker);
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run(broker.as_ref(), &cancel).await })
    };
    while broker.stats().subscribers == 0 {
        sleep(Duration::from_millis(1)).await;
    }

    info!("file backend example started");
    let batch = (1..=5)
        .map(|i| {
            let message = if i == 3 { "checkout failed" } else { "heartbeat" };
            LogRecord::new(message, Utc::now())
                .with_session("demo-session")
                .with_sequence(i)
        })
        .collect();
    broker.publish(&cancel, batch).expect("publish");
    // Captured by the broker layer and written next to the client records.
    error!(session_id = "demo-session", "simulated error sent via file backend");

    sleep(Duration::from_millis(200)).await;

    let router = StoreRouter::from_dsns(Some(&dsn), None).expect("failed to open file store");
    let request = QueryRequest {
        subscriber_type: Some("file".into()),
        search: Some("failed".into()),
        session_id: Some("demo-session".into()),
        context: Some(1),
        ..Default::default()
    };
    match router.query(&CancellationToken::new(), request).await {
        Ok(records) => {
            for record in records {
                println!("[{}] {} {}", record.time, record.level, record.message);
            }
        }
        Err(e) => eprintln!("query failed: {e}"),
    }

    cancel.cancel();
    let _ = task.await;
}
