//! System configuration
//!
//! The configuration is an explicit value threaded through constructors.
//! [`ConfigHandle`] lets it be replaced at runtime; the new log level is
//! pushed to the subscriber.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

use crate::breaker::BreakerConfig;
use crate::logging::{parse_filter, LogHandle};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("maxCallLengthSeconds ({call}) must not exceed maxCachingSeconds ({caching})")]
    CallLengthExceedsCaching { call: u64, caching: u64 },

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("Unknown configuration key from {var}")]
    UnknownKey { var: String },

    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },

    #[error("Configuration does not deserialize: {0}")]
    Deserialize(String),
}

/// Where a module's (excluded) HTTP surface listens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_prefix: Option<String>,
}

/// Complete system configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemConfig {
    /// TTL of correlation records and callback registrations
    pub max_caching_seconds: u64,
    /// TTL of in-flight call records; at most `max_caching_seconds`
    pub max_call_length_seconds: u64,
    pub log_level: String,
    /// Per event group endpoint settings
    pub modules: BTreeMap<String, EndpointConfig>,
    pub breaker: BreakerConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        let mut modules = BTreeMap::new();
        modules.insert(
            "configuration".to_string(),
            EndpointConfig {
                host: "localhost".to_string(),
                port: 8081,
                endpoint_prefix: Some("configuration".to_string()),
            },
        );
        Self {
            max_caching_seconds: 10,
            max_call_length_seconds: 5,
            log_level: "info".to_string(),
            modules,
            breaker: BreakerConfig::default(),
        }
    }
}

impl SystemConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_call_length_seconds > self.max_caching_seconds {
            return Err(ConfigError::CallLengthExceedsCaching {
                call: self.max_call_length_seconds,
                caching: self.max_caching_seconds,
            });
        }
        parse_filter(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel(self.log_level.clone()))?;
        Ok(())
    }

    /// Set caching windows
    pub fn with_caching(mut self, max_caching_seconds: u64, max_call_length_seconds: u64) -> Self {
        self.max_caching_seconds = max_caching_seconds;
        self.max_call_length_seconds = max_call_length_seconds;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Defaults overlaid with `PREFIX_`-prefixed environment pairs
    pub fn from_env<I>(prefix: &str, env: I) -> Result<(Self, Vec<ConfigError>), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let defaults = serde_json::to_value(Self::default()).map_err(|e| ConfigError::Deserialize(e.to_string()))?;
        let outcome = merge_env(&defaults, env, prefix);
        let config: Self =
            serde_json::from_value(outcome.config).map_err(|e| ConfigError::Deserialize(e.to_string()))?;
        Ok((config, outcome.errors))
    }
}

/// Result of overlaying environment variables on defaults
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub config: Value,
    pub errors: Vec<ConfigError>,
}

/// Overlay `PREFIX_SEG1_SEG2=value` pairs on `defaults`.
///
/// Segments are matched case-insensitively against the keys already present
/// in `defaults`, so the defaults double as the key map. Values are coerced
/// to the type of the value they replace. Problems are collected, not raised.
pub fn merge_env<I>(defaults: &Value, env: I, prefix: &str) -> MergeOutcome
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut config = defaults.clone();
    let mut errors = Vec::new();
    let wanted = format!("{}_", prefix.to_ascii_lowercase());

    for (var, raw) in env {
        let lowered = var.to_ascii_lowercase();
        let Some(rest) = lowered.strip_prefix(&wanted) else {
            continue;
        };
        let segments: Vec<&str> = rest.split('_').filter(|s| !s.is_empty()).collect();
        if let Err(e) = apply(&mut config, &segments, &raw, &var) {
            errors.push(e);
        }
    }

    MergeOutcome { config, errors }
}

fn apply(target: &mut Value, segments: &[&str], raw: &str, var: &str) -> Result<(), ConfigError> {
    let Some((head, tail)) = segments.split_first() else {
        return Err(ConfigError::UnknownKey { var: var.to_string() });
    };
    let Value::Object(map) = target else {
        return Err(ConfigError::UnknownKey { var: var.to_string() });
    };
    let Some(key) = find_key(map, head) else {
        return Err(ConfigError::UnknownKey { var: var.to_string() });
    };
    let slot = map
        .get_mut(&key)
        .ok_or_else(|| ConfigError::UnknownKey { var: var.to_string() })?;

    if tail.is_empty() {
        *slot = coerce(slot, raw).map_err(|reason| ConfigError::InvalidValue {
            var: var.to_string(),
            reason,
        })?;
        Ok(())
    } else {
        apply(slot, tail, raw, var)
    }
}

fn find_key(map: &Map<String, Value>, segment: &str) -> Option<String> {
    map.keys().find(|k| k.eq_ignore_ascii_case(segment)).cloned()
}

fn coerce(current: &Value, raw: &str) -> Result<Value, String> {
    match current {
        Value::Bool(_) => raw
            .parse::<bool>()
            .map(Value::Bool)
            .map_err(|e| e.to_string()),
        Value::Number(n) if n.is_u64() => raw
            .parse::<u64>()
            .map(Value::from)
            .map_err(|e| e.to_string()),
        Value::Number(_) => raw
            .parse::<f64>()
            .map_err(|e| e.to_string())
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number).ok_or_else(|| "not finite".to_string())),
        Value::Object(_) | Value::Array(_) => serde_json::from_str(raw).map_err(|e| e.to_string()),
        Value::String(_) | Value::Null => Ok(Value::String(raw.to_string())),
    }
}

/// Live configuration, replaceable at runtime
pub struct ConfigHandle {
    current: RwLock<Arc<SystemConfig>>,
    log: Option<LogHandle>,
}

impl ConfigHandle {
    /// Rejects an invalid startup configuration
    pub fn new(config: SystemConfig, log: Option<LogHandle>) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        Ok(Arc::new(Self {
            current: RwLock::new(Arc::new(config)),
            log,
        }))
    }

    pub fn get(&self) -> Arc<SystemConfig> {
        self.current.read().clone()
    }

    /// Validate and swap in a new configuration
    pub fn set_config(&self, config: SystemConfig) -> Result<(), ConfigError> {
        config.validate()?;
        if let Some(log) = &self.log {
            log.set_level(&config.log_level)
                .map_err(|_| ConfigError::InvalidLogLevel(config.log_level.clone()))?;
        }
        info!(
            "Configuration updated (maxCachingSeconds={}, logLevel={})",
            config.max_caching_seconds, config.log_level
        );
        *self.current.write() = Arc::new(config);
        Ok(())
    }
}
