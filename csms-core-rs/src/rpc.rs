//! OCPP-J RPC framing
//!
//! Every OCPP version shares the same JSON array framing:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]

use serde_json::Value;
use thiserror::Error;

use crate::error::ErrorCode;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// Errors raised while decoding a raw frame
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message format: {reason}")]
    InvalidFormat {
        message_id: Option<String>,
        reason: &'static str,
    },

    #[error("Unknown message type: {type_id}")]
    UnknownMessageType {
        message_id: Option<String>,
        type_id: Value,
    },
}

impl FrameError {
    /// Message id recovered from the broken frame, if any, so it can still be answered
    pub fn message_id(&self) -> Option<&str> {
        match self {
            FrameError::Json(_) => None,
            FrameError::InvalidFormat { message_id, .. }
            | FrameError::UnknownMessageType { message_id, .. } => message_id.as_deref(),
        }
    }

    /// Error code the station should receive for this failure
    pub fn error_code(&self) -> ErrorCode {
        match self {
            FrameError::UnknownMessageType { .. } => ErrorCode::MessageTypeNotSupported,
            FrameError::Json(_) | FrameError::InvalidFormat { .. } => ErrorCode::RpcFrameworkError,
        }
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    pub fn new(message_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            action: action.into(),
            payload,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            &self.action,
            &self.payload
        ])
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            payload,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!([
            MessageType::CallResult as i32,
            &self.message_id,
            &self.payload
        ])
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn to_value(&self) -> Value {
        serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            self.error_code.as_str(),
            &self.error_description,
            &self.error_details
        ])
    }

    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }
}

/// Parsed OCPP frame (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum RpcFrame {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl RpcFrame {
    /// Parse a frame from its text form
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let Value::Array(mut array) = value else {
            return Err(FrameError::InvalidFormat {
                message_id: None,
                reason: "frame is not a JSON array",
            });
        };

        let message_id = array.get(1).and_then(Value::as_str).map(str::to_string);
        let invalid = |reason: &'static str| FrameError::InvalidFormat {
            message_id: message_id.clone(),
            reason,
        };

        let Some(type_id) = array.first().cloned() else {
            return Err(invalid("empty frame"));
        };
        let Some(msg_type) = type_id.as_i64() else {
            return Err(invalid("messageTypeId is not an integer"));
        };
        let Some(id) = message_id.clone() else {
            return Err(invalid("messageId is not a string"));
        };

        match msg_type {
            2 => {
                if array.len() != 4 {
                    return Err(invalid("CALL must have 4 elements"));
                }
                let action = array[2]
                    .as_str()
                    .ok_or_else(|| invalid("action is not a string"))?
                    .to_string();
                let payload = array.swap_remove(3);
                Ok(RpcFrame::Call(Call {
                    message_id: id,
                    action,
                    payload,
                }))
            }
            3 => {
                if array.len() != 3 {
                    return Err(invalid("CALLRESULT must have 3 elements"));
                }
                let payload = array.swap_remove(2);
                Ok(RpcFrame::CallResult(CallResult {
                    message_id: id,
                    payload,
                }))
            }
            4 => {
                if array.len() != 5 {
                    return Err(invalid("CALLERROR must have 5 elements"));
                }
                let error_code = array[2]
                    .as_str()
                    .map(ErrorCode::from_wire)
                    .ok_or_else(|| invalid("errorCode is not a string"))?;
                let error_description = array[3].as_str().unwrap_or("").to_string();
                let error_details = array.swap_remove(4);
                Ok(RpcFrame::CallError(CallError {
                    message_id: id,
                    error_code,
                    error_description,
                    error_details,
                }))
            }
            _ => Err(FrameError::UnknownMessageType {
                message_id,
                type_id,
            }),
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            RpcFrame::Call(c) => &c.message_id,
            RpcFrame::CallResult(r) => &r.message_id,
            RpcFrame::CallError(e) => &e.message_id,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RpcFrame::Call(c) => c.to_value(),
            RpcFrame::CallResult(r) => r.to_value(),
            RpcFrame::CallError(e) => e.to_value(),
        }
    }

    /// Serialize to the OCPP-J text form
    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }
}

impl From<Call> for RpcFrame {
    fn from(call: Call) -> Self {
        RpcFrame::Call(call)
    }
}

impl From<CallResult> for RpcFrame {
    fn from(result: CallResult) -> Self {
        RpcFrame::CallResult(result)
    }
}

impl From<CallError> for RpcFrame {
    fn from(error: CallError) -> Self {
        RpcFrame::CallError(error)
    }
}
