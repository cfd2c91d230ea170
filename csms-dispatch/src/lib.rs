//! CSMS Dispatch
//!
//! The module dispatch engine shared by every functional module, and the
//! message router standing between station connections and the bus.
//!
//! ```text
//! station -> MessageRouter -> bus -> Module -> handler
//!                  ^                    |
//!                  +------- bus <-------+
//! ```

pub mod blacklist;
pub mod callback;
pub mod handlers;
pub mod module;
pub mod router;

use std::fmt;

use csms_core::{BusError, OcppError};
use thiserror::Error;

pub use blacklist::ActionBlacklist;
pub use callback::CallbackForwarder;
pub use handlers::{Handler, HandlerTable, HandlerTableBuilder};
pub use module::{Module, ModuleSpec, OutboundCall};
pub use router::{MessageRouter, StationNetwork};

/// Errors raised while dispatching a message to a handler
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Protocol error, forwarded to the station as is
    #[error(transparent)]
    Ocpp(#[from] OcppError),

    #[error("{0}")]
    Handler(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl DispatchError {
    pub fn handler(message: impl fmt::Display) -> Self {
        DispatchError::Handler(message.to_string())
    }
}
