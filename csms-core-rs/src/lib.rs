//! CSMS Core Library
//!
//! Shared building blocks of the charging station management system:
//! OCPP-J framing and error taxonomy, the bus envelope, the cache and bus
//! contracts (with in-process implementations), the circuit breaker, and
//! configuration and logging setup.

pub mod types;
pub mod error;
pub mod rpc;
pub mod envelope;
pub mod cache;
pub mod bus;
pub mod breaker;
pub mod config;
pub mod logging;

pub use types::*;
pub use error::{ErrorCode, OcppError};
pub use rpc::{Call, CallError, CallResult, FrameError, RpcFrame};
pub use envelope::{build_call, build_call_error, build_call_result, Message, MessageContext, Payload, Route};
pub use cache::{Cache, CacheChange, MemoryCache};
pub use bus::{BusError, EnvelopeSink, FilterProperties, LocalBus, MessageHandler, MessageSender};
pub use breaker::{BreakerConfig, BreakerError, BreakerState, CircuitBreaker};
pub use config::{ConfigError, ConfigHandle, SystemConfig};
