//! Schema registry
//!
//! Maps (protocol version, action, direction) to a JSON Schema document. The
//! documents are opaque to this crate; a representative subset is bundled and
//! the rest can be inserted by the surrounding system.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;

use csms_core::{MessageState, OcppVersion};

use crate::ValidatorError;

/// Which half of an exchange a payload belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Request => "Request",
            Direction::Response => "Response",
        }
    }
}

impl From<MessageState> for Direction {
    fn from(state: MessageState) -> Self {
        match state {
            MessageState::Request => Direction::Request,
            MessageState::Response => Direction::Response,
        }
    }
}

type SchemaKey = (OcppVersion, String, Direction);

/// (version, action, direction) -> schema document
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<SchemaKey, Arc<Value>>,
}

/// Bundled schema files: version, action, request document, response document
const BUNDLED: &[(OcppVersion, &str, &str, &str)] = &[
    (
        OcppVersion::Ocpp16,
        "BootNotification",
        include_str!("../schemas/ocpp1.6/BootNotification.json"),
        include_str!("../schemas/ocpp1.6/BootNotificationResponse.json"),
    ),
    (
        OcppVersion::Ocpp16,
        "Heartbeat",
        include_str!("../schemas/ocpp1.6/Heartbeat.json"),
        include_str!("../schemas/ocpp1.6/HeartbeatResponse.json"),
    ),
    (
        OcppVersion::Ocpp16,
        "StatusNotification",
        include_str!("../schemas/ocpp1.6/StatusNotification.json"),
        include_str!("../schemas/ocpp1.6/StatusNotificationResponse.json"),
    ),
    (
        OcppVersion::Ocpp16,
        "DataTransfer",
        include_str!("../schemas/ocpp1.6/DataTransfer.json"),
        include_str!("../schemas/ocpp1.6/DataTransferResponse.json"),
    ),
    (
        OcppVersion::Ocpp201,
        "BootNotification",
        include_str!("../schemas/ocpp2.0.1/BootNotificationRequest.json"),
        include_str!("../schemas/ocpp2.0.1/BootNotificationResponse.json"),
    ),
    (
        OcppVersion::Ocpp201,
        "Heartbeat",
        include_str!("../schemas/ocpp2.0.1/HeartbeatRequest.json"),
        include_str!("../schemas/ocpp2.0.1/HeartbeatResponse.json"),
    ),
    (
        OcppVersion::Ocpp201,
        "StatusNotification",
        include_str!("../schemas/ocpp2.0.1/StatusNotificationRequest.json"),
        include_str!("../schemas/ocpp2.0.1/StatusNotificationResponse.json"),
    ),
    (
        OcppVersion::Ocpp201,
        "DataTransfer",
        include_str!("../schemas/ocpp2.0.1/DataTransferRequest.json"),
        include_str!("../schemas/ocpp2.0.1/DataTransferResponse.json"),
    ),
    (
        OcppVersion::Ocpp21,
        "BootNotification",
        include_str!("../schemas/ocpp2.1/BootNotificationRequest.json"),
        include_str!("../schemas/ocpp2.1/BootNotificationResponse.json"),
    ),
    (
        OcppVersion::Ocpp21,
        "Heartbeat",
        include_str!("../schemas/ocpp2.1/HeartbeatRequest.json"),
        include_str!("../schemas/ocpp2.1/HeartbeatResponse.json"),
    ),
];

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the schemas shipped in this crate
    pub fn bundled() -> Result<Self, ValidatorError> {
        let mut registry = Self::new();
        for (version, action, request, response) in BUNDLED {
            for (direction, text) in [(Direction::Request, request), (Direction::Response, response)] {
                let schema: Value = serde_json::from_str(text).map_err(|e| ValidatorError::Bundled {
                    name: format!("{}/{}{}", version, action, direction.as_str()),
                    reason: e.to_string(),
                })?;
                registry.insert(*version, action, direction, schema);
            }
        }
        Ok(registry)
    }

    /// Register or replace a schema; returns the replaced document
    pub fn insert(
        &mut self,
        version: OcppVersion,
        action: &str,
        direction: Direction,
        schema: Value,
    ) -> Option<Arc<Value>> {
        self.schemas
            .insert((version, action.to_string(), direction), Arc::new(schema))
    }

    pub fn get(&self, version: OcppVersion, action: &str, direction: Direction) -> Option<Arc<Value>> {
        self.schemas
            .get(&(version, action.to_string(), direction))
            .cloned()
    }

    /// Every action with at least one schema under `version`, sorted
    pub fn actions(&self, version: OcppVersion) -> Vec<String> {
        self.schemas
            .keys()
            .filter(|(v, _, _)| *v == version)
            .map(|(_, action, _)| action.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
