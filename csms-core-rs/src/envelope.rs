//! Transport-independent message envelope
//!
//! The envelope is what moves across the bus. Router and modules both build
//! envelopes through the functions in this module so a message looks the same
//! whichever side produced it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OcppError;
use crate::rpc::{Call, CallError, CallResult, RpcFrame};
use crate::types::{EventGroup, Identifier, MessageOrigin, MessageState, OcppVersion};

/// Routing metadata attached to every envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContext {
    pub station_id: String,
    pub tenant_id: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub protocol: OcppVersion,
}

impl MessageContext {
    pub fn identifier(&self) -> Identifier {
        Identifier::new(self.tenant_id.clone(), self.station_id.clone())
    }
}

/// Typed envelope payload.
///
/// A response carries either a result or an error, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "lowercase")]
pub enum Payload {
    Request(Value),
    Response(Value),
    Error(OcppError),
}

impl Payload {
    /// The only envelope state this payload may travel under
    pub fn state(&self) -> MessageState {
        match self {
            Payload::Request(_) => MessageState::Request,
            Payload::Response(_) | Payload::Error(_) => MessageState::Response,
        }
    }
}

/// Internal unit moving through the message bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub origin: MessageOrigin,
    pub event_group: EventGroup,
    pub action: String,
    pub state: MessageState,
    pub context: MessageContext,
    pub payload: Payload,
    pub protocol: OcppVersion,
}

impl Message {
    pub fn identifier(&self) -> Identifier {
        self.context.identifier()
    }

    pub fn correlation_id(&self) -> &str {
        &self.context.correlation_id
    }

    /// Error carried by a response, if any
    pub fn error(&self) -> Option<&OcppError> {
        match &self.payload {
            Payload::Error(e) => Some(e),
            _ => None,
        }
    }

    /// JSON body of the payload; errors serialize to their structured form
    pub fn payload_value(&self) -> Value {
        match &self.payload {
            Payload::Request(v) | Payload::Response(v) => v.clone(),
            Payload::Error(e) => serde_json::to_value(e).unwrap_or(Value::Null),
        }
    }

    /// Render as the wire frame the station would see
    pub fn to_frame(&self) -> RpcFrame {
        let message_id = self.context.correlation_id.clone();
        match &self.payload {
            Payload::Request(payload) => RpcFrame::Call(Call::new(message_id, self.action.clone(), payload.clone())),
            Payload::Response(payload) => RpcFrame::CallResult(CallResult::new(message_id, payload.clone())),
            Payload::Error(error) => RpcFrame::CallError(CallError {
                message_id,
                ..error.as_call_error()
            }),
        }
    }
}

/// Destination and provenance shared by the builders
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub identifier: Identifier,
    pub correlation_id: String,
    pub action: String,
    pub event_group: EventGroup,
    pub origin: MessageOrigin,
    pub protocol: OcppVersion,
    /// Receipt time at the edge; `None` stamps "now"
    pub timestamp: Option<DateTime<Utc>>,
}

impl Route {
    pub fn new(
        identifier: Identifier,
        correlation_id: impl Into<String>,
        action: impl Into<String>,
        protocol: OcppVersion,
    ) -> Self {
        Self {
            identifier,
            correlation_id: correlation_id.into(),
            action: action.into(),
            event_group: EventGroup::General,
            origin: MessageOrigin::StationManagementSystem,
            protocol,
            timestamp: None,
        }
    }

    pub fn with_event_group(mut self, event_group: EventGroup) -> Self {
        self.event_group = event_group;
        self
    }

    pub fn with_origin(mut self, origin: MessageOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    fn into_message(self, state: MessageState, payload: Payload) -> Message {
        Message {
            origin: self.origin,
            event_group: self.event_group,
            action: self.action,
            state,
            context: MessageContext {
                station_id: self.identifier.station_id,
                tenant_id: self.identifier.tenant_id,
                correlation_id: self.correlation_id,
                timestamp: self.timestamp.unwrap_or_else(Utc::now),
                protocol: self.protocol,
            },
            payload,
            protocol: self.protocol,
        }
    }
}

/// Build a request envelope
pub fn build_call(route: Route, payload: Value) -> Message {
    route.into_message(MessageState::Request, Payload::Request(payload))
}

/// Build a successful response envelope
pub fn build_call_result(route: Route, payload: Value) -> Message {
    route.into_message(MessageState::Response, Payload::Response(payload))
}

/// Build an error response envelope
pub fn build_call_error(route: Route, error: OcppError) -> Message {
    route.into_message(MessageState::Response, Payload::Error(error))
}

/// Build the envelope for a frame received from a station.
///
/// `action` is required for results and errors because their frames do not
/// carry it; callers take it from the pending call record.
pub fn from_frame(frame: RpcFrame, action: Option<&str>, route: Route) -> Message {
    match frame {
        RpcFrame::Call(call) => {
            let route = Route {
                action: call.action,
                correlation_id: call.message_id,
                ..route
            };
            build_call(route, call.payload)
        }
        RpcFrame::CallResult(result) => {
            let route = Route {
                action: action.map(str::to_string).unwrap_or(route.action),
                correlation_id: result.message_id,
                ..route
            };
            build_call_result(route, result.payload)
        }
        RpcFrame::CallError(error) => {
            let route = Route {
                action: action.map(str::to_string).unwrap_or(route.action),
                correlation_id: error.message_id.clone(),
                ..route
            };
            build_call_error(route, OcppError::from(error))
        }
    }
}
