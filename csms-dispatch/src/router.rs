//! Message router
//!
//! Single entry and exit point between station connections and the bus. Raw
//! frames are parsed, sanitized and validated against the connection's
//! protocol before becoming envelopes; a frame that fails any of these checks
//! is answered with a CallError right here, without a module round-trip.
//!
//! In-flight calls are tracked per station in the shared cache: at most one
//! station call awaiting our answer and one of our calls awaiting the
//! station's answer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use csms_core::bus::props;
use csms_core::{
    build_call, build_call_error, build_call_result, BreakerError, Cache, CacheNamespace, Call, CallError,
    CallResult, CircuitBreaker, ConfigHandle, EnvelopeSink, ErrorCode, FilterProperties, Identifier, Message,
    MessageConfirmation, MessageHandler, MessageOrigin, MessageSender, MessageState, OcppError, OcppVersion,
    Payload, Route, RpcFrame, BOOT_NOTIFICATION,
};
use csms_validator::{sanitize_ocpp_payload, Direction, OcppValidator};

use crate::blacklist::ActionBlacklist;
use crate::DispatchError;

/// Message id used when a broken frame has no readable one
const UNKNOWN_MESSAGE_ID: &str = "-1";

/// Delivery of raw frames to connected stations
#[async_trait]
pub trait StationNetwork: Send + Sync {
    /// Queue `text` for the station; false when it is not connected here
    async fn send_to_station(&self, identifier: &Identifier, text: String) -> bool;
}

/// `action:messageId` record of a call in flight
#[derive(Debug, Clone, PartialEq, Eq)]
struct InFlight {
    action: String,
    message_id: String,
}

impl InFlight {
    fn new(action: &str, message_id: &str) -> Self {
        Self {
            action: action.to_string(),
            message_id: message_id.to_string(),
        }
    }

    fn encode(&self) -> String {
        format!("{}:{}", self.action, self.message_id)
    }

    fn decode(value: &str) -> Option<Self> {
        value.split_once(':').map(|(action, message_id)| Self::new(action, message_id))
    }
}

pub struct MessageRouter {
    config: Arc<ConfigHandle>,
    cache: Arc<dyn Cache>,
    validator: Arc<OcppValidator>,
    sender: Arc<dyn MessageSender>,
    handler: Arc<dyn MessageHandler>,
    network: Arc<dyn StationNetwork>,
    blacklist: ActionBlacklist,
    bus_breaker: CircuitBreaker,
    /// One breaker per station; a failing station does not silence the others
    station_breakers: RwLock<HashMap<Identifier, Arc<CircuitBreaker>>>,
}

impl MessageRouter {
    /// Build the router and start consuming CSMS-originated envelopes
    pub async fn new(
        config: Arc<ConfigHandle>,
        cache: Arc<dyn Cache>,
        validator: Arc<OcppValidator>,
        sender: Arc<dyn MessageSender>,
        handler: Arc<dyn MessageHandler>,
        network: Arc<dyn StationNetwork>,
    ) -> Result<Arc<Self>, DispatchError> {
        let breaker = config.get().breaker.clone();
        let router = Arc::new(MessageRouter {
            blacklist: ActionBlacklist::new(cache.clone()),
            bus_breaker: CircuitBreaker::new("router-bus", breaker),
            station_breakers: RwLock::new(HashMap::new()),
            config,
            cache,
            validator,
            sender,
            handler,
            network,
        });

        let sink: Arc<dyn EnvelopeSink> = router.clone();
        router.handler.set_module(Arc::downgrade(&sink));
        router.handler.init_connection().await?;
        Ok(router)
    }

    pub fn blacklist(&self) -> &ActionBlacklist {
        &self.blacklist
    }

    pub fn validator(&self) -> Arc<OcppValidator> {
        self.validator.clone()
    }

    fn call_ttl(&self) -> u64 {
        self.config.get().max_call_length_seconds
    }

    /// Record a live connection and start routing envelopes addressed to it
    pub async fn register_connection(&self, identifier: &Identifier, protocol: OcppVersion) -> bool {
        let key = identifier.to_string();
        self.cache
            .set(
                &key,
                protocol.as_str().to_string(),
                Some(CacheNamespace::Connections.as_str()),
                None,
            )
            .await;

        let mut filter = FilterProperties::new();
        filter.insert(props::STATION_ID.into(), identifier.station_id.clone());
        filter.insert(props::TENANT_ID.into(), identifier.tenant_id.clone());
        filter.insert(
            props::ORIGIN.into(),
            MessageOrigin::StationManagementSystem.as_str().into(),
        );
        match self.handler.subscribe(&key, None, filter).await {
            Ok(subscribed) => {
                info!("Registered connection {} ({})", key, protocol);
                subscribed
            }
            Err(e) => {
                warn!("Failed to subscribe {}: {}", key, e);
                false
            }
        }
    }

    /// Forget a connection and its in-flight calls
    pub async fn deregister_connection(&self, identifier: &Identifier) -> bool {
        let key = identifier.to_string();
        let existed = self
            .cache
            .remove(&key, Some(CacheNamespace::Connections.as_str()))
            .await;
        self.cache.remove(&key, Some(CacheNamespace::InboundCalls.as_str())).await;
        self.cache.remove(&key, Some(CacheNamespace::OutboundCalls.as_str())).await;
        if let Err(e) = self.handler.unsubscribe(&key).await {
            warn!("Failed to unsubscribe {}: {}", key, e);
        }
        self.station_breakers.write().remove(identifier);
        info!("Deregistered connection {}", key);
        existed
    }

    /// Handle a raw frame received from `identifier`.
    ///
    /// `timestamp` is the receipt time at the edge. Returns whether the frame
    /// was accepted for processing, not whether processing succeeded.
    pub async fn on_message(&self, identifier: &Identifier, raw: &str, timestamp: DateTime<Utc>, protocol: &str) -> bool {
        let version = match protocol.parse::<OcppVersion>() {
            Ok(version) => version,
            Err(e) => {
                warn!("Dropping frame from {}: {}", identifier, e);
                return false;
            }
        };

        let frame = match RpcFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Malformed frame from {}: {}", identifier, e);
                let message_id = e.message_id().unwrap_or(UNKNOWN_MESSAGE_ID);
                let error = OcppError::new(message_id, e.error_code(), e.to_string());
                self.send_frame(identifier, RpcFrame::CallError(error.as_call_error())).await;
                return false;
            }
        };
        debug!("Received {} from {}", raw, identifier);

        match frame {
            RpcFrame::Call(call) => self.on_call(identifier, version, call, timestamp).await,
            RpcFrame::CallResult(result) => self.on_call_result(identifier, version, result, timestamp).await,
            RpcFrame::CallError(error) => self.on_call_error(identifier, version, error, timestamp).await,
        }
    }

    async fn on_call(&self, identifier: &Identifier, version: OcppVersion, call: Call, timestamp: DateTime<Utc>) -> bool {
        let Call {
            message_id,
            action,
            payload,
        } = call;

        if action != BOOT_NOTIFICATION && self.blacklist.is_blacklisted(identifier, &action).await {
            warn!("{} sent blacklisted {} before boot was accepted", identifier, action);
            let error = OcppError::new(
                &message_id,
                ErrorCode::SecurityError,
                format!("{} is not allowed until BootNotification is accepted", action),
            );
            self.send_frame(identifier, RpcFrame::CallError(error.as_call_error())).await;
            return false;
        }

        let payload = sanitize_ocpp_payload(payload);
        let outcome = self
            .validator
            .validate(version.as_str(), &action, Direction::Request, &payload);
        if !outcome.is_valid {
            warn!("Invalid {} request from {}: {:?}", action, identifier, outcome.errors);
            let error = OcppError::new(
                &message_id,
                ErrorCode::format_violation(version),
                format!("Invalid {} request", action),
            )
            .with_details(outcome.details());
            self.send_frame(identifier, RpcFrame::CallError(error.as_call_error())).await;
            return false;
        }

        let key = identifier.to_string();
        let record = InFlight::new(&action, &message_id);
        let claimed = self
            .cache
            .set_if_not_exist(
                &key,
                record.encode(),
                Some(CacheNamespace::InboundCalls.as_str()),
                Some(self.call_ttl()),
            )
            .await;
        if !claimed {
            warn!("{} sent {} while another call is in progress", identifier, action);
            let error = OcppError::new(&message_id, ErrorCode::RpcFrameworkError, "Call already in progress");
            self.send_frame(identifier, RpcFrame::CallError(error.as_call_error())).await;
            return false;
        }

        let route = Route::new(identifier.clone(), &message_id, &action, version)
            .with_origin(MessageOrigin::ChargingStation)
            .at(timestamp);
        let confirmation = self.publish(build_call(route, payload), MessageState::Request).await;
        if !confirmation.success {
            warn!("Could not publish {} from {}: {:?}", action, identifier, confirmation.payload);
            self.cache
                .remove(&key, Some(CacheNamespace::InboundCalls.as_str()))
                .await;
            let error = OcppError::internal(&message_id, "Unable to process request");
            self.send_frame(identifier, RpcFrame::CallError(error.as_call_error())).await;
            return false;
        }
        if confirmation.delivered() == Some(0) {
            warn!("No module handles {} from {}", action, identifier);
            self.cache
                .remove(&key, Some(CacheNamespace::InboundCalls.as_str()))
                .await;
            let error = OcppError::not_supported(&message_id, format!("{} is not supported", action))
                .with_details(serde_json::json!({ "action": action }));
            self.send_frame(identifier, RpcFrame::CallError(error.as_call_error())).await;
            return false;
        }
        true
    }

    /// Claim the outstanding-call record matching `message_id`
    async fn take_outbound(&self, identifier: &Identifier, message_id: &str) -> Option<InFlight> {
        let key = identifier.to_string();
        let namespace = Some(CacheNamespace::OutboundCalls.as_str());
        let Some(record) = self.cache.get(&key, namespace).await.as_deref().and_then(InFlight::decode) else {
            warn!("Unexpected response {} from {}: no call outstanding", message_id, identifier);
            return None;
        };
        if record.message_id != message_id {
            warn!(
                "Response {} from {} does not match outstanding call {} ({})",
                message_id, identifier, record.message_id, record.action
            );
            return None;
        }
        self.cache.remove(&key, namespace).await;
        Some(record)
    }

    async fn on_call_result(
        &self,
        identifier: &Identifier,
        version: OcppVersion,
        result: CallResult,
        timestamp: DateTime<Utc>,
    ) -> bool {
        let Some(record) = self.take_outbound(identifier, &result.message_id).await else {
            return false;
        };
        let route = Route::new(identifier.clone(), &result.message_id, &record.action, version)
            .with_origin(MessageOrigin::ChargingStation)
            .at(timestamp);

        let payload = sanitize_ocpp_payload(result.payload);
        let outcome = self
            .validator
            .validate(version.as_str(), &record.action, Direction::Response, &payload);
        let message = if outcome.is_valid {
            build_call_result(route, payload)
        } else {
            warn!("Invalid {} response from {}: {:?}", record.action, identifier, outcome.errors);
            let error = OcppError::new(
                &result.message_id,
                ErrorCode::format_violation(version),
                format!("Invalid {} response", record.action),
            )
            .with_details(outcome.details());
            build_call_error(route, error)
        };

        self.publish(message, MessageState::Response).await.success
    }

    async fn on_call_error(
        &self,
        identifier: &Identifier,
        version: OcppVersion,
        error: CallError,
        timestamp: DateTime<Utc>,
    ) -> bool {
        let Some(record) = self.take_outbound(identifier, &error.message_id).await else {
            return false;
        };
        info!(
            "{} answered {} with {}: {}",
            identifier, record.action, error.error_code, error.error_description
        );
        let route = Route::new(identifier.clone(), &error.message_id, &record.action, version)
            .with_origin(MessageOrigin::ChargingStation)
            .at(timestamp);
        self.publish(build_call_error(route, OcppError::from(error)), MessageState::Response)
            .await
            .success
    }

    /// Deliver a CSMS call to its station, waiting out a call already in flight
    async fn send_call(&self, message: Message, payload: Value) -> bool {
        let identifier = message.identifier();
        let outcome = self
            .validator
            .validate(message.protocol.as_str(), &message.action, Direction::Request, &payload);
        if !outcome.is_valid {
            warn!(
                "Not sending invalid {} to {}: {:?}",
                message.action, identifier, outcome.errors
            );
            return false;
        }

        let key = identifier.to_string();
        let namespace = Some(CacheNamespace::OutboundCalls.as_str());
        let record = InFlight::new(&message.action, message.correlation_id()).encode();
        let ttl = self.call_ttl();

        if !self.cache.set_if_not_exist(&key, record.clone(), namespace, Some(ttl)).await {
            debug!("{} has a call in flight, waiting before {}", identifier, message.action);
            self.cache.on_change(&key, Duration::from_secs(ttl), namespace).await;
            if !self.cache.set_if_not_exist(&key, record, namespace, Some(ttl)).await {
                warn!(
                    "Dropping {} to {}: previous call still outstanding after {}s",
                    message.action, identifier, ttl
                );
                return false;
            }
        }

        let frame = RpcFrame::Call(Call::new(message.correlation_id(), &message.action, payload));
        let sent = self.send_frame(&identifier, frame).await;
        if !sent {
            self.cache.remove(&key, namespace).await;
        }
        sent
    }

    /// Deliver a module's answer to the station call it belongs to
    async fn send_reply(&self, message: Message) -> bool {
        let identifier = message.identifier();
        let key = identifier.to_string();
        let namespace = Some(CacheNamespace::InboundCalls.as_str());
        let correlation_id = message.correlation_id().to_string();

        let Some(record) = self.cache.get(&key, namespace).await.as_deref().and_then(InFlight::decode) else {
            warn!("No call from {} awaits answer {}", identifier, correlation_id);
            return false;
        };
        if record.message_id != correlation_id {
            warn!(
                "Answer {} for {} does not match pending call {} ({})",
                correlation_id, identifier, record.message_id, record.action
            );
            return false;
        }

        let frame = match message.payload {
            Payload::Response(payload) => {
                let payload = sanitize_ocpp_payload(payload);
                let outcome = self
                    .validator
                    .validate(message.protocol.as_str(), &record.action, Direction::Response, &payload);
                if outcome.is_valid {
                    RpcFrame::CallResult(CallResult::new(&correlation_id, payload))
                } else {
                    warn!("Module produced invalid {} response: {:?}", record.action, outcome.errors);
                    let error = OcppError::internal(&correlation_id, format!("Invalid {} response", record.action))
                        .with_details(outcome.details());
                    RpcFrame::CallError(error.as_call_error())
                }
            }
            Payload::Error(error) => RpcFrame::CallError(CallError {
                message_id: correlation_id.clone(),
                ..error.as_call_error()
            }),
            Payload::Request(_) => return false,
        };

        // Released first: the station may send its next call as soon as it has the answer.
        self.cache.remove(&key, namespace).await;
        self.send_frame(&identifier, frame).await
    }

    fn station_breaker(&self, identifier: &Identifier) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.station_breakers.read().get(identifier) {
            return breaker.clone();
        }
        self.station_breakers
            .write()
            .entry(identifier.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    format!("station-send:{}", identifier),
                    self.config.get().breaker.clone(),
                ))
            })
            .clone()
    }

    async fn send_frame(&self, identifier: &Identifier, frame: RpcFrame) -> bool {
        let text = frame.to_text();
        let network = self.network.clone();
        let breaker = self.station_breaker(identifier);
        let sent = breaker
            .call(|| async move {
                if network.send_to_station(identifier, text).await {
                    Ok(())
                } else {
                    Err(())
                }
            })
            .await;
        match sent {
            Ok(()) => true,
            Err(BreakerError::Open(name)) => {
                warn!("Not sending to {}: circuit breaker {} is open", identifier, name);
                false
            }
            Err(BreakerError::Inner(())) => {
                warn!("Station {} is not reachable", identifier);
                false
            }
        }
    }

    async fn publish(&self, message: Message, state: MessageState) -> MessageConfirmation {
        let sender = self.sender.clone();
        let published = self
            .bus_breaker
            .call(|| async move {
                let confirmation = sender.send(message, state).await;
                if confirmation.success {
                    Ok(confirmation)
                } else {
                    Err(confirmation)
                }
            })
            .await;
        match published {
            Ok(confirmation) | Err(BreakerError::Inner(confirmation)) => confirmation,
            Err(BreakerError::Open(name)) => MessageConfirmation::failure(format!("Circuit breaker {} is open", name)),
        }
    }

    pub async fn shutdown(&self) {
        info!("Message router shutting down");
        self.handler.shutdown().await;
        self.sender.shutdown().await;
    }
}

#[async_trait]
impl EnvelopeSink for MessageRouter {
    async fn handle(&self, message: Message, _properties: FilterProperties) {
        let request = match &message.payload {
            Payload::Request(payload) => Some(sanitize_ocpp_payload(payload.clone())),
            Payload::Response(_) | Payload::Error(_) => None,
        };
        let delivered = match request {
            Some(payload) => self.send_call(message, payload).await,
            None => self.send_reply(message).await,
        };
        if !delivered {
            debug!("Envelope for station was not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_record() {
        let record = InFlight::new("Heartbeat", "abc:123");
        assert_eq!(record.encode(), "Heartbeat:abc:123");
        assert_eq!(InFlight::decode("Heartbeat:abc:123"), Some(record));
        assert_eq!(InFlight::decode("garbage"), None);
    }
}
