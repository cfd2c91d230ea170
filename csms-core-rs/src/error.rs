//! OCPP error taxonomy
//!
//! `OcppError` is the single internal representation of a protocol error.
//! It is turned into a wire `CallError` through [`OcppError::as_call_error`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::rpc::CallError;
use crate::types::OcppVersion;

/// OCPP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    /// OCPP 1.6 spelling of `FormatViolation`
    FormationViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
        }
    }

    /// Parse a wire error code; unknown codes degrade to `GenericError`
    pub fn from_wire(code: &str) -> Self {
        serde_json::from_value(Value::String(code.to_string())).unwrap_or(ErrorCode::GenericError)
    }

    /// The format-violation code as spelled by the given protocol version
    pub fn format_violation(version: OcppVersion) -> Self {
        match version {
            OcppVersion::Ocpp16 => ErrorCode::FormationViolation,
            OcppVersion::Ocpp201 | OcppVersion::Ocpp21 => ErrorCode::FormatViolation,
        }
    }

    /// Same code with the 1.6-only alias folded back into `FormatViolation`
    pub fn normalized(&self) -> Self {
        match self {
            ErrorCode::FormationViolation => ErrorCode::FormatViolation,
            other => *other,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol error raised while handling the message `message_id`
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code} ({message_id}): {description}")]
#[serde(rename_all = "camelCase")]
pub struct OcppError {
    pub message_id: String,
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl OcppError {
    pub fn new(message_id: impl Into<String>, code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            code,
            description: description.into(),
            details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn not_supported(message_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(message_id, ErrorCode::NotSupported, description)
    }

    pub fn internal(message_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(message_id, ErrorCode::InternalError, description)
    }

    /// Convert to the wire frame. Pure; calling it twice yields equal frames.
    pub fn as_call_error(&self) -> CallError {
        CallError {
            message_id: self.message_id.clone(),
            error_code: self.code,
            error_description: self.description.clone(),
            error_details: self.details.clone(),
        }
    }
}

impl From<CallError> for OcppError {
    fn from(frame: CallError) -> Self {
        Self {
            message_id: frame.message_id,
            code: frame.error_code,
            description: frame.error_description,
            details: frame.error_details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_as_call_error_is_repeatable() {
        let error = OcppError::new("42", ErrorCode::NotSupported, "nope")
            .with_details(json!({"action": "UnknownAction"}));

        let first = error.as_call_error();
        let second = error.as_call_error();
        assert_eq!(first, second);
        assert_eq!(
            first.to_text(),
            r#"[4,"42","NotSupported","nope",{"action":"UnknownAction"}]"#
        );
    }

    #[test]
    fn test_error_code_wire_names() {
        assert_eq!(ErrorCode::from_wire("FormationViolation"), ErrorCode::FormationViolation);
        assert_eq!(ErrorCode::from_wire("SomethingElse"), ErrorCode::GenericError);
        assert_eq!(ErrorCode::format_violation(OcppVersion::Ocpp16), ErrorCode::FormationViolation);
        assert_eq!(ErrorCode::format_violation(OcppVersion::Ocpp21), ErrorCode::FormatViolation);
        assert_eq!(ErrorCode::FormationViolation.normalized(), ErrorCode::FormatViolation);
    }
}
