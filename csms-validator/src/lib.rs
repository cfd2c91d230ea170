//! CSMS Protocol Validator
//!
//! JSON Schema validation of OCPP payloads keyed by protocol version, action
//! and direction, with a bundled subset of the OCPP schemas.

pub mod registry;
pub mod sanitize;
pub mod validator;

use thiserror::Error;

pub use registry::{Direction, SchemaRegistry};
pub use sanitize::sanitize_ocpp_payload;
pub use validator::{OcppValidator, SchemaViolation, ValidationOutcome};

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("No schema for {action} under {protocol}")]
    UnknownAction { protocol: String, action: String },

    #[error("Schema {key} does not compile: {reason}")]
    InvalidSchema { key: String, reason: String },

    #[error("Bundled schema {name} is not valid JSON: {reason}")]
    Bundled { name: String, reason: String },
}
