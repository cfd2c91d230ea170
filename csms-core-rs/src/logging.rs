//! Logging setup with a reloadable level filter

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log level {level:?}: {reason}")]
    InvalidLevel { level: String, reason: String },

    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),

    #[error("Failed to reload log filter: {0}")]
    Reload(String),
}

/// Parse a level or filter directive such as `info` or `csms_dispatch=debug,warn`
pub fn parse_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_new(level).map_err(|e| LoggingError::InvalidLevel {
        level: level.to_string(),
        reason: e.to_string(),
    })
}

/// Handle for changing the active level after startup
#[derive(Clone)]
pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    pub fn set_level(&self, level: &str) -> Result<(), LoggingError> {
        let filter = parse_filter(level)?;
        self.handle
            .reload(filter)
            .map_err(|e| LoggingError::Reload(e.to_string()))
    }
}

/// Install the global subscriber
pub fn init_logging(level: &str) -> Result<LogHandle, LoggingError> {
    let filter = parse_filter(level)?;
    let (filter_layer, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    Ok(LogHandle { handle })
}
