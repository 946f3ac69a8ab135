pub mod record;
pub mod error;
pub mod broker;
pub mod query;
pub mod window;
pub mod file_store;
pub mod columnar;
pub mod sink;
pub mod file_sink;
pub mod layer;

#[cfg(feature = "clickhouse")]
pub mod clickhouse;

pub mod auth;
pub mod backend;
pub mod env;
pub mod ingest;
pub mod init;
pub mod noop_sink;

pub use broker::{Batch, BrokerStats, MemoryBroker, Publisher, Subscriber, Subscription};
pub use error::{BrokerError, QueryError, SinkError};
pub use query::{ContextWindow, LogStore, QueryParams, QueryRequest};
pub use record::{Level, LogRecord};
