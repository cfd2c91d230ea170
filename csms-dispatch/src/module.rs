//! Module dispatch engine
//!
//! Runtime shared by every functional module. A module subscribes to the
//! request and response traffic of its event group, dispatches each envelope
//! to the handler registered for (protocol, action), and translates handler
//! failures into CallErrors when a reply is owed.
//!
//! Outbound traffic goes through [`Module::send_call`] and the
//! `send_call_result*` / `send_call_error*` builders; every publish is guarded
//! by a circuit breaker.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use csms_core::bus::props;
use csms_core::{
    build_call, build_call_error, build_call_result, BreakerError, Cache, CacheChange, CacheNamespace,
    CircuitBreaker, ConfigHandle, EnvelopeSink, EventGroup, FilterProperties, Identifier, Message,
    MessageConfirmation, MessageHandler, MessageOrigin, MessageSender, MessageState, OcppError, OcppVersion,
    Payload, Route,
};

use crate::callback::CallbackForwarder;
use crate::handlers::HandlerTable;
use crate::DispatchError;

/// What a module listens to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    pub event_group: EventGroup,
    /// Station-originated calls this module answers
    pub requests: Vec<String>,
    /// Station answers to calls this module sends
    pub responses: Vec<String>,
}

impl ModuleSpec {
    pub fn new(event_group: EventGroup) -> Self {
        Self {
            event_group,
            requests: Vec::new(),
            responses: Vec::new(),
        }
    }

    pub fn with_requests<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requests = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_responses<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.responses = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn request_queue(&self) -> String {
        format!("{}_requests", self.event_group)
    }

    pub fn response_queue(&self) -> String {
        format!("{}_responses", self.event_group)
    }
}

/// A CSMS-initiated call toward a station
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCall {
    pub identifier: Identifier,
    pub protocol: OcppVersion,
    pub action: String,
    pub payload: Value,
    pub correlation_id: Option<String>,
    pub callback_url: Option<String>,
}

impl OutboundCall {
    pub fn new(identifier: Identifier, protocol: OcppVersion, action: impl Into<String>, payload: Value) -> Self {
        Self {
            identifier,
            protocol,
            action: action.into(),
            payload,
            correlation_id: None,
            callback_url: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }
}

/// Per-module dispatch runtime
pub struct Module {
    me: Weak<Module>,
    spec: ModuleSpec,
    handlers: HandlerTable,
    config: Arc<ConfigHandle>,
    cache: Arc<dyn Cache>,
    sender: Arc<dyn MessageSender>,
    handler: Arc<dyn MessageHandler>,
    callbacks: CallbackForwarder,
    bus_breaker: CircuitBreaker,
}

impl Module {
    /// Build the module, attach it to `handler` and start both subscriptions
    pub async fn init(
        spec: ModuleSpec,
        handlers: HandlerTable,
        config: Arc<ConfigHandle>,
        cache: Arc<dyn Cache>,
        sender: Arc<dyn MessageSender>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Arc<Self>, DispatchError> {
        let breaker_config = config.get().breaker.clone();
        let module = Arc::new_cyclic(|me| Module {
            me: me.clone(),
            bus_breaker: CircuitBreaker::new(format!("{}-bus", spec.event_group), breaker_config),
            callbacks: CallbackForwarder::new(cache.clone(), config.clone()),
            spec,
            handlers,
            config,
            cache,
            sender,
            handler,
        });

        let sink: Arc<dyn EnvelopeSink> = module.clone();
        module.handler.set_module(Arc::downgrade(&sink));

        if !module.spec.requests.is_empty() {
            module
                .handler
                .subscribe(
                    &module.spec.request_queue(),
                    Some(module.spec.requests.clone()),
                    station_filter(MessageState::Request),
                )
                .await?;
        }
        if !module.spec.responses.is_empty() {
            module
                .handler
                .subscribe(
                    &module.spec.response_queue(),
                    Some(module.spec.responses.clone()),
                    station_filter(MessageState::Response),
                )
                .await?;
        }
        module.handler.init_connection().await?;

        info!(
            "Module {} started ({} handlers, {} request actions, {} response actions)",
            module.spec.event_group,
            module.handlers.len(),
            module.spec.requests.len(),
            module.spec.responses.len()
        );
        Ok(module)
    }

    pub fn spec(&self) -> &ModuleSpec {
        &self.spec
    }

    pub fn config(&self) -> Arc<ConfigHandle> {
        self.config.clone()
    }

    pub fn cache(&self) -> Arc<dyn Cache> {
        self.cache.clone()
    }

    /// Dispatch one inbound envelope to its handler
    pub async fn dispatch(&self, message: Message) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        debug!(
            "Dispatching {} {} from {} ({})",
            message.action,
            message.state.as_str(),
            message.context.station_id,
            message.correlation_id()
        );

        if message.state == MessageState::Response {
            self.callbacks.forward(&message);
            self.persist_response(&message).await;
        }

        let outcome = match self.handlers.get(message.protocol, &message.action) {
            Some(handler) => {
                let envelope = message.clone();
                AssertUnwindSafe(async move { handler(this, envelope).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(DispatchError::Panicked(panic_message(panic))))
            }
            None => Err(DispatchError::Ocpp(
                OcppError::not_supported(
                    message.correlation_id(),
                    format!("{} is not supported under {}", message.action, message.protocol),
                )
                .with_details(json!({ "action": message.action })),
            )),
        };

        if let Err(e) = outcome {
            self.on_failure(&message, e).await;
        }
    }

    async fn on_failure(&self, message: &Message, failure: DispatchError) {
        match message.state {
            MessageState::Request => {
                error!(
                    "Handling {} from {} failed: {}",
                    message.action, message.context.station_id, failure
                );
                let error = match failure {
                    DispatchError::Ocpp(error) => error,
                    other => OcppError::internal(message.correlation_id(), other.to_string()),
                };
                let confirmation = self.send_call_error_with_message(message, error).await;
                if !confirmation.success {
                    warn!("CallError for {} was not published: {:?}", message.correlation_id(), confirmation.payload);
                }
            }
            // Nobody is waiting for an answer to an answer.
            MessageState::Response => {
                error!(
                    "Handling {} response from {} failed: {}",
                    message.action, message.context.station_id, failure
                );
            }
        }
    }

    /// Make a response visible to whoever waits on its correlation id
    async fn persist_response(&self, message: &Message) {
        let value = match &message.payload {
            Payload::Error(e) => serde_json::to_string(e),
            _ => serde_json::to_string(&message.payload_value()),
        };
        let value = match value {
            Ok(value) => value,
            Err(e) => {
                warn!("Response {} does not serialize: {}", message.correlation_id(), e);
                return;
            }
        };
        let ttl = self.config.get().max_caching_seconds;
        let namespace = message.identifier().to_string();
        self.cache
            .set(message.correlation_id(), value, Some(&namespace), Some(ttl))
            .await;
    }

    /// Wait for the response to `correlation_id`, by default up to `maxCachingSeconds`
    pub async fn wait_for_response(
        &self,
        identifier: &Identifier,
        correlation_id: &str,
        wait: Option<Duration>,
    ) -> CacheChange {
        let namespace = identifier.to_string();
        let wait = wait.unwrap_or_else(|| Duration::from_secs(self.config.get().max_caching_seconds));
        self.cache.get_or_wait(correlation_id, wait, Some(&namespace)).await
    }

    /// Send a call to a station.
    ///
    /// Fails without publishing when the station is not connected or is
    /// connected under a different protocol version.
    pub async fn send_call(&self, call: OutboundCall) -> MessageConfirmation {
        let key = call.identifier.to_string();
        let Some(connected) = self
            .cache
            .get(&key, Some(CacheNamespace::Connections.as_str()))
            .await
        else {
            warn!("No connection found for {}", key);
            return MessageConfirmation::failure(format!("No connection found for {}", key));
        };

        if connected != call.protocol.as_str() {
            warn!(
                "Refusing {} to {}: connected with {}, call is {}",
                call.action, key, connected, call.protocol
            );
            return MessageConfirmation::failure(format!(
                "Protocol mismatch for {}: connection uses {}, call uses {}",
                key, connected, call.protocol
            ));
        }

        let correlation_id = call.correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        // Stored before publishing so a fast response finds it.
        if let Some(url) = &call.callback_url {
            self.callbacks.register(&call.identifier, &correlation_id, url).await;
        }

        let route = Route::new(call.identifier, correlation_id.clone(), call.action, call.protocol)
            .with_event_group(self.spec.event_group)
            .with_origin(MessageOrigin::StationManagementSystem);
        let confirmation = self.publish(build_call(route, call.payload), MessageState::Request).await;
        if confirmation.delivered() == Some(0) {
            warn!("Call {} to {} reached no router", correlation_id, key);
            return MessageConfirmation::failure(format!("No route to {}", key));
        }
        if confirmation.success {
            MessageConfirmation::ok_with(json!({ "correlationId": correlation_id }))
        } else {
            confirmation
        }
    }

    pub async fn send_call_result(
        &self,
        identifier: Identifier,
        correlation_id: &str,
        action: &str,
        protocol: OcppVersion,
        payload: Value,
    ) -> MessageConfirmation {
        let route = self.reply_route(identifier, correlation_id, action, protocol);
        self.publish(build_call_result(route, payload), MessageState::Response).await
    }

    /// Answer the call carried by `message`
    pub async fn send_call_result_with_message(&self, message: &Message, payload: Value) -> MessageConfirmation {
        self.send_call_result(
            message.identifier(),
            message.correlation_id(),
            &message.action,
            message.protocol,
            payload,
        )
        .await
    }

    pub async fn send_call_error(
        &self,
        identifier: Identifier,
        correlation_id: &str,
        action: &str,
        protocol: OcppVersion,
        error: OcppError,
    ) -> MessageConfirmation {
        let route = self.reply_route(identifier, correlation_id, action, protocol);
        self.publish(build_call_error(route, error), MessageState::Response).await
    }

    pub async fn send_call_error_with_message(&self, message: &Message, error: OcppError) -> MessageConfirmation {
        self.send_call_error(
            message.identifier(),
            message.correlation_id(),
            &message.action,
            message.protocol,
            error,
        )
        .await
    }

    fn reply_route(&self, identifier: Identifier, correlation_id: &str, action: &str, protocol: OcppVersion) -> Route {
        Route::new(identifier, correlation_id, action, protocol)
            .with_event_group(self.spec.event_group)
            .with_origin(MessageOrigin::StationManagementSystem)
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

    /// Release bus resources
    pub async fn shutdown(&self) {
        info!("Module {} shutting down", self.spec.event_group);
        self.handler.shutdown().await;
        self.sender.shutdown().await;
    }
}

#[async_trait]
impl EnvelopeSink for Module {
    async fn handle(&self, message: Message, _properties: FilterProperties) {
        self.dispatch(message).await;
    }
}

/// Station-originated traffic in the given state
fn station_filter(state: MessageState) -> FilterProperties {
    let mut filter = FilterProperties::new();
    filter.insert(props::STATE.into(), state.as_str().into());
    filter.insert(props::ORIGIN.into(), MessageOrigin::ChargingStation.as_str().into());
    filter
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
