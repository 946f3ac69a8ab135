use crate::broker::Publisher;
use crate::layer::BrokerLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Diagnostics configuration of a process embedding the broker.
///
/// **Fields**
/// - `filter`: `EnvFilter` directives, e.g. `"info,log_harbor=debug"`.
/// - `enable_stdout`: if `true`, a `tracing_subscriber::fmt` layer prints
///   events to the console.
/// - `capture_level`: events at this level and above are published back
///   through the broker by [`BrokerLayer`]; `None` disables capture.
/// - `source`: value of [`LogRecord::source`](crate::record::LogRecord)
///   on captured events.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    pub filter: String,
    pub enable_stdout: bool,
    pub capture_level: Option<tracing::Level>,
    pub source: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            enable_stdout: true,
            capture_level: Some(tracing::Level::ERROR),
            source: "log-harbor".to_string(),
        }
    }
}

/// Errors returned while installing the global subscriber.
#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(#[from] tracing_subscriber::filter::ParseError),

    #[error("global subscriber already set: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

impl InitError {
    pub fn as_label(&self) -> &'static str {
        match self {
            InitError::InvalidFilter(_) => "init_invalid_filter",
            InitError::AlreadyInitialized(_) => "init_already_initialized",
        }
    }
}

/// Install a global subscriber without broker capture.
///
/// `capture_level` is ignored since there is no broker to publish into.
pub fn init_tracing(config: &TracingConfig) -> Result<(), InitError> {
    install::<std::sync::Arc<crate::broker::MemoryBroker>>(None, config)
}

/// Install a global subscriber whose captured events go to `publisher`.
///
/// **Effects**
///
/// This installs a [`Registry`] combined with an [`EnvFilter`], the
/// optional `fmt` layer and a [`BrokerLayer`] as the global default
/// subscriber, so all `tracing` events in the process are observed.
pub fn init_tracing_with_broker<P>(publisher: P, config: &TracingConfig) -> Result<(), InitError>
where
    P: Publisher + 'static,
{
    install(Some(publisher), config)
}

fn install<P>(publisher: Option<P>, config: &TracingConfig) -> Result<(), InitError>
where
    P: Publisher + 'static,
{
    let filter = EnvFilter::try_new(&config.filter)?;
    let fmt_layer = config.enable_stdout.then(tracing_subscriber::fmt::layer);
    let broker_layer = match (publisher, config.capture_level) {
        (Some(publisher), Some(level)) => Some(BrokerLayer::new(publisher, level, config.source.clone())),
        _ => None,
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(fmt_layer)
        .with(broker_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_filter_is_rejected_before_install() {
        let config = TracingConfig {
            filter: "info,app=loudest".to_string(),
            ..Default::default()
        };
        let err = init_tracing(&config).unwrap_err();
        assert_eq!(err.as_label(), "init_invalid_filter");
    }
}
