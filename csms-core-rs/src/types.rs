//! Core types shared by every CSMS component

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Action name used for the station registration handshake
pub const BOOT_NOTIFICATION: &str = "BootNotification";

/// Vendor extension action whose inner `data` is free-form
pub const DATA_TRANSFER: &str = "DataTransfer";

/// OCPP protocol dialects understood by the CSMS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OcppVersion {
    #[serde(rename = "ocpp1.6")]
    Ocpp16,
    #[serde(rename = "ocpp2.0.1")]
    Ocpp201,
    #[serde(rename = "ocpp2.1")]
    Ocpp21,
}

impl OcppVersion {
    pub const ALL: [OcppVersion; 3] = [OcppVersion::Ocpp16, OcppVersion::Ocpp201, OcppVersion::Ocpp21];

    /// Wire name, also used as the WebSocket subprotocol
    pub fn as_str(&self) -> &'static str {
        match self {
            OcppVersion::Ocpp16 => "ocpp1.6",
            OcppVersion::Ocpp201 => "ocpp2.0.1",
            OcppVersion::Ocpp21 => "ocpp2.1",
        }
    }
}

impl fmt::Display for OcppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unsupported protocol: {0}")]
pub struct UnknownProtocol(pub String);

impl FromStr for OcppVersion {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ocpp1.6" => Ok(OcppVersion::Ocpp16),
            "ocpp2.0.1" => Ok(OcppVersion::Ocpp201),
            "ocpp2.1" => Ok(OcppVersion::Ocpp21),
            other => Err(UnknownProtocol(other.to_string())),
        }
    }
}

/// Which side of the OCPP connection produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageOrigin {
    StationManagementSystem,
    ChargingStation,
}

impl MessageOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageOrigin::StationManagementSystem => "station-management-system",
            MessageOrigin::ChargingStation => "charging-station",
        }
    }
}

/// Whether an envelope carries a request or its answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    Request,
    Response,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Request => "request",
            MessageState::Response => "response",
        }
    }
}

/// Functional domain of a module, used for bus routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventGroup {
    General,
    Certificates,
    Configuration,
    EVDriver,
    Monitoring,
    Reporting,
    SmartCharging,
    Tenant,
    Transactions,
}

impl EventGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventGroup::General => "general",
            EventGroup::Certificates => "certificates",
            EventGroup::Configuration => "configuration",
            EventGroup::EVDriver => "evdriver",
            EventGroup::Monitoring => "monitoring",
            EventGroup::Reporting => "reporting",
            EventGroup::SmartCharging => "smartcharging",
            EventGroup::Tenant => "tenant",
            EventGroup::Transactions => "transactions",
        }
    }
}

impl fmt::Display for EventGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache namespaces used by the messaging layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheNamespace {
    /// Identifier -> negotiated protocol of the live connection
    Connections,
    /// Identifier -> `action:messageId` of the station call awaiting our answer
    InboundCalls,
    /// Identifier -> `action:messageId` of our call awaiting the station's answer
    OutboundCalls,
    /// Per-station action blacklist while boot is not accepted
    Blacklist,
}

impl CacheNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheNamespace::Connections => "connections",
            CacheNamespace::InboundCalls => "inbound-calls",
            CacheNamespace::OutboundCalls => "outbound-calls",
            CacheNamespace::Blacklist => "blacklist",
        }
    }
}

/// Tenant-scoped station key, `tenantId:stationId`.
///
/// Tenant ids never contain `:`; station ids may.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier {
    pub tenant_id: String,
    pub station_id: String,
}

impl Identifier {
    pub fn new(tenant_id: impl Into<String>, station_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            station_id: station_id.into(),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tenant_id, self.station_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid identifier: {0}")]
pub struct InvalidIdentifier(pub String);

impl FromStr for Identifier {
    type Err = InvalidIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((tenant, station)) if !tenant.is_empty() && !station.is_empty() => {
                Ok(Identifier::new(tenant, station))
            }
            _ => Err(InvalidIdentifier(s.to_string())),
        }
    }
}

/// Non-throwing outcome of a send, publish or administrative call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageConfirmation {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl MessageConfirmation {
    pub fn ok() -> Self {
        Self { success: true, payload: None }
    }

    pub fn ok_with(payload: Value) -> Self {
        Self { success: true, payload: Some(payload) }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: Some(Value::String(reason.into())),
        }
    }

    /// Number of queues a successful publish reached, when the bus reports it
    pub fn delivered(&self) -> Option<u64> {
        if !self.success {
            return None;
        }
        self.payload.as_ref()?.get("delivered")?.as_u64()
    }

    /// Failure reason, if this is a failure carrying a string payload
    pub fn reason(&self) -> Option<&str> {
        if self.success {
            return None;
        }
        self.payload.as_ref().and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_round_trip() {
        let id = Identifier::new("tenant-1", "CS:001");
        let text = id.to_string();
        assert_eq!(text, "tenant-1:CS:001");

        let parsed: Identifier = text.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_identifier_rejects_missing_parts() {
        assert!("no-colon".parse::<Identifier>().is_err());
        assert!(":station".parse::<Identifier>().is_err());
        assert!("tenant:".parse::<Identifier>().is_err());
    }

    #[test]
    fn test_protocol_names() {
        for version in OcppVersion::ALL {
            assert_eq!(version.as_str().parse::<OcppVersion>().unwrap(), version);
        }
        assert!("ocpp1.5".parse::<OcppVersion>().is_err());
        assert_eq!(
            serde_json::to_value(OcppVersion::Ocpp201).unwrap(),
            Value::String("ocpp2.0.1".into())
        );
    }

    #[test]
    fn test_confirmation_reason() {
        assert_eq!(MessageConfirmation::failure("no connection").reason(), Some("no connection"));
        assert_eq!(MessageConfirmation::ok().reason(), None);
    }
}
