//! Message bus contract and an in-process broker
//!
//! Modules and the router never call each other directly. They publish
//! envelopes through a [`MessageSender`] and receive them through a
//! [`MessageHandler`] subscription filtered by envelope properties.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::envelope::Message;
use crate::types::{MessageConfirmation, MessageState};

/// Property bag used for server-side subscription filtering
pub type FilterProperties = HashMap<String, String>;

pub mod props {
    pub const STATE: &str = "state";
    pub const ORIGIN: &str = "origin";
    pub const STATION_ID: &str = "stationId";
    pub const TENANT_ID: &str = "tenantId";
    pub const ACTION: &str = "action";
    pub const EVENT_GROUP: &str = "eventGroup";
}

/// Properties a broker exposes for filtering a given envelope
pub fn message_properties(message: &Message) -> FilterProperties {
    let mut properties = FilterProperties::new();
    properties.insert(props::STATE.into(), message.state.as_str().into());
    properties.insert(props::ORIGIN.into(), message.origin.as_str().into());
    properties.insert(props::STATION_ID.into(), message.context.station_id.clone());
    properties.insert(props::TENANT_ID.into(), message.context.tenant_id.clone());
    properties.insert(props::ACTION.into(), message.action.clone());
    properties.insert(props::EVENT_GROUP.into(), message.event_group.as_str().into());
    properties
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Bus connection closed")]
    Closed,

    #[error("No module registered with the handler")]
    NoModule,

    #[error("Bus error: {0}")]
    Other(String),
}

/// Entry point a handler delivers inbound envelopes to
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn handle(&self, message: Message, properties: FilterProperties);
}

/// Publishing side of the bus
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_request(&self, message: Message) -> MessageConfirmation {
        self.send(message, MessageState::Request).await
    }

    async fn send_response(&self, message: Message) -> MessageConfirmation {
        self.send(message, MessageState::Response).await
    }

    /// Publish with the given state stamped on the envelope
    async fn send(&self, message: Message, state: MessageState) -> MessageConfirmation;

    async fn shutdown(&self);
}

/// Consuming side of the bus
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn init_connection(&self) -> Result<(), BusError>;

    /// Subscribe `queue` to envelopes whose action is in `actions` (all when
    /// `None`) and whose properties contain every pair in `filter`
    async fn subscribe(
        &self,
        queue: &str,
        actions: Option<Vec<String>>,
        filter: FilterProperties,
    ) -> Result<bool, BusError>;

    async fn unsubscribe(&self, queue: &str) -> Result<bool, BusError>;

    /// Back-reference to the component that receives this handler's traffic
    fn set_module(&self, module: Weak<dyn EnvelopeSink>);

    async fn shutdown(&self);
}

struct Subscription {
    owner: u64,
    queue: String,
    actions: Option<HashSet<String>>,
    filter: FilterProperties,
    tx: mpsc::UnboundedSender<(Message, FilterProperties)>,
}

impl Subscription {
    fn matches(&self, message: &Message, properties: &FilterProperties) -> bool {
        if let Some(actions) = &self.actions {
            if !actions.contains(&message.action) {
                return false;
            }
        }
        self.filter
            .iter()
            .all(|(k, v)| properties.get(k).is_some_and(|actual| actual == v))
    }
}

#[derive(Default)]
struct Broker {
    subscriptions: RwLock<Vec<Subscription>>,
    round_robin: AtomicUsize,
    next_owner: AtomicU64,
    closed: AtomicBool,
}

impl Broker {
    /// Deliver to one subscriber per matching queue; returns the queue count
    fn publish(&self, message: Message) -> usize {
        let properties = message_properties(&message);
        let subscriptions = self.subscriptions.read();

        let mut by_queue: HashMap<&str, Vec<&Subscription>> = HashMap::new();
        for sub in subscriptions.iter().filter(|s| s.matches(&message, &properties)) {
            by_queue.entry(sub.queue.as_str()).or_default().push(sub);
        }

        let turn = self.round_robin.fetch_add(1, Ordering::Relaxed);
        let mut delivered = 0;
        for (queue, consumers) in by_queue {
            let consumer = consumers[turn % consumers.len()];
            if consumer.tx.send((message.clone(), properties.clone())).is_ok() {
                delivered += 1;
            } else {
                warn!("Queue {} has a closed consumer", queue);
            }
        }
        delivered
    }
}

/// In-process broker; hands out senders and handlers bound to it
#[derive(Clone, Default)]
pub struct LocalBus {
    broker: Arc<Broker>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(&self) -> LocalSender {
        LocalSender {
            broker: self.broker.clone(),
        }
    }

    pub fn handler(&self) -> LocalHandler {
        let owner = self.broker.next_owner.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        LocalHandler {
            owner,
            broker: self.broker.clone(),
            tx,
            rx: Mutex::new(Some(rx)),
            module: RwLock::new(None),
            consumer: Mutex::new(None),
        }
    }

    /// Number of live subscriptions, across all handlers
    pub fn subscription_count(&self) -> usize {
        self.broker.subscriptions.read().len()
    }

    /// Stop accepting publishes
    pub fn close(&self) {
        self.broker.closed.store(true, Ordering::SeqCst);
    }
}

pub struct LocalSender {
    broker: Arc<Broker>,
}

#[async_trait]
impl MessageSender for LocalSender {
    async fn send(&self, mut message: Message, state: MessageState) -> MessageConfirmation {
        if self.broker.closed.load(Ordering::SeqCst) {
            return MessageConfirmation::failure("bus closed");
        }
        if message.payload.state() != state {
            warn!(
                "Refusing to publish {} as {}: payload is a {}",
                message.action,
                state.as_str(),
                message.payload.state().as_str()
            );
            return MessageConfirmation::failure(format!(
                "{} payload cannot be sent as {}",
                message.payload.state().as_str(),
                state.as_str()
            ));
        }
        message.state = state;
        debug!(
            "Publishing {} {} for {} ({})",
            message.action,
            state.as_str(),
            message.context.station_id,
            message.context.correlation_id
        );
        let delivered = self.broker.publish(message);
        MessageConfirmation::ok_with(serde_json::json!({ "delivered": delivered }))
    }

    async fn shutdown(&self) {}
}

pub struct LocalHandler {
    owner: u64,
    broker: Arc<Broker>,
    tx: mpsc::UnboundedSender<(Message, FilterProperties)>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<(Message, FilterProperties)>>>,
    module: RwLock<Option<Weak<dyn EnvelopeSink>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl MessageHandler for LocalHandler {
    async fn init_connection(&self) -> Result<(), BusError> {
        let module = self.module.read().clone().ok_or(BusError::NoModule)?;
        let Some(mut rx) = self.rx.lock().take() else {
            // Already consuming.
            return Ok(());
        };

        let handle = tokio::spawn(async move {
            while let Some((message, properties)) = rx.recv().await {
                let Some(sink) = module.upgrade() else {
                    debug!("Handler target dropped, stopping consumer");
                    break;
                };
                // Each envelope runs on its own task so one slow handler does
                // not hold back other stations.
                tokio::spawn(async move {
                    sink.handle(message, properties).await;
                });
            }
        });
        *self.consumer.lock() = Some(handle);
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        actions: Option<Vec<String>>,
        filter: FilterProperties,
    ) -> Result<bool, BusError> {
        if self.broker.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        info!("Subscribing queue {} (actions={:?}, filter={:?})", queue, actions, filter);
        self.broker.subscriptions.write().push(Subscription {
            owner: self.owner,
            queue: queue.to_string(),
            actions: actions.map(|a| a.into_iter().collect()),
            filter,
            tx: self.tx.clone(),
        });
        Ok(true)
    }

    async fn unsubscribe(&self, queue: &str) -> Result<bool, BusError> {
        let mut subscriptions = self.broker.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| !(s.owner == self.owner && s.queue == queue));
        Ok(subscriptions.len() != before)
    }

    fn set_module(&self, module: Weak<dyn EnvelopeSink>) {
        *self.module.write() = Some(module);
    }

    async fn shutdown(&self) {
        self.broker.subscriptions.write().retain(|s| s.owner != self.owner);
        if let Some(handle) = self.consumer.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{build_call, build_call_result, Route};
    use crate::types::{Identifier, MessageOrigin, OcppVersion};
    use serde_json::json;
    use std::time::Duration;

    struct Recorder {
        seen: tokio::sync::mpsc::UnboundedSender<Message>,
    }

    #[async_trait]
    impl EnvelopeSink for Recorder {
        async fn handle(&self, message: Message, _properties: FilterProperties) {
            let _ = self.seen.send(message);
        }
    }

    fn heartbeat(station: &str, origin: MessageOrigin) -> Message {
        build_call(
            Route::new(Identifier::new("t1", station), "1", "Heartbeat", OcppVersion::Ocpp201).with_origin(origin),
            json!({}),
        )
    }

    async fn attach(handler: &LocalHandler) -> (Arc<Recorder>, mpsc::UnboundedReceiver<Message>) {
        let (seen, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder { seen });
        let sink: Arc<dyn EnvelopeSink> = recorder.clone();
        handler.set_module(Arc::downgrade(&sink));
        handler.init_connection().await.unwrap();
        (recorder, rx)
    }

    #[tokio::test]
    async fn test_property_filtering() {
        let bus = LocalBus::new();
        let handler = bus.handler();
        let (_recorder, mut rx) = attach(&handler).await;

        let mut filter = FilterProperties::new();
        filter.insert(props::STATION_ID.into(), "CS001".into());
        filter.insert(props::ORIGIN.into(), MessageOrigin::ChargingStation.as_str().into());
        handler.subscribe("cs001", None, filter).await.unwrap();

        let sender = bus.sender();
        sender.send_request(heartbeat("CS002", MessageOrigin::ChargingStation)).await;
        sender.send_request(heartbeat("CS001", MessageOrigin::StationManagementSystem)).await;
        sender.send_request(heartbeat("CS001", MessageOrigin::ChargingStation)).await;

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.context.station_id, "CS001");
        assert_eq!(got.origin, MessageOrigin::ChargingStation);
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_action_scoping_and_unsubscribe() {
        let bus = LocalBus::new();
        let handler = bus.handler();
        let (_recorder, mut rx) = attach(&handler).await;

        handler
            .subscribe("boot", Some(vec!["BootNotification".into()]), FilterProperties::new())
            .await
            .unwrap();
        let sender = bus.sender();
        sender.send_request(heartbeat("CS001", MessageOrigin::ChargingStation)).await;
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());

        handler.subscribe("all", None, FilterProperties::new()).await.unwrap();
        assert!(handler.unsubscribe("all").await.unwrap());
        assert!(!handler.unsubscribe("all").await.unwrap());
        assert_eq!(bus.subscription_count(), 1);

        handler.shutdown().await;
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_state_is_stamped_and_closed_bus_fails() {
        let bus = LocalBus::new();
        let handler = bus.handler();
        let (_recorder, mut rx) = attach(&handler).await;

        let mut filter = FilterProperties::new();
        filter.insert(props::STATE.into(), "response".into());
        handler.subscribe("responses", None, filter).await.unwrap();

        let sender = bus.sender();
        let mut answer = build_call_result(
            Route::new(Identifier::new("t1", "CS001"), "1", "Heartbeat", OcppVersion::Ocpp201),
            json!({"currentTime": "2026-01-20T12:00:00Z"}),
        );
        answer.state = MessageState::Request;
        let confirmation = sender.send_response(answer).await;
        assert!(confirmation.success);
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.state, MessageState::Response);

        // A call cannot travel as a response
        let confirmation = sender.send_response(heartbeat("CS001", MessageOrigin::ChargingStation)).await;
        assert!(!confirmation.success);
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());

        bus.close();
        let confirmation = sender.send_request(heartbeat("CS001", MessageOrigin::ChargingStation)).await;
        assert!(!confirmation.success);
    }

    #[tokio::test]
    async fn test_init_without_module_fails() {
        let bus = LocalBus::new();
        assert!(matches!(bus.handler().init_connection().await, Err(BusError::NoModule)));
    }
}
