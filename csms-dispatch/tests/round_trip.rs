//! End-to-end tests: router + module over the in-process bus and cache

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use csms_core::bus::LocalSender;
use csms_core::{
    Cache, CacheChange, ConfigHandle, ErrorCode, EventGroup, Identifier, LocalBus, MemoryCache, Message,
    MessageConfirmation, MessageSender, MessageState, OcppVersion, RpcFrame, SystemConfig,
};
use csms_dispatch::{DispatchError, HandlerTable, MessageRouter, Module, ModuleSpec, OutboundCall, StationNetwork};
use csms_validator::OcppValidator;

struct RecordingNetwork {
    tx: mpsc::UnboundedSender<(Identifier, String)>,
}

#[async_trait]
impl StationNetwork for RecordingNetwork {
    async fn send_to_station(&self, identifier: &Identifier, text: String) -> bool {
        // GONE stands for a station whose socket is already dead
        if identifier.station_id == "GONE" {
            return false;
        }
        self.tx.send((identifier.clone(), text)).is_ok()
    }
}

/// Bus sender that counts what the module publishes
struct CountingSender {
    inner: LocalSender,
    sends: Arc<AtomicUsize>,
}

#[async_trait]
impl MessageSender for CountingSender {
    async fn send(&self, message: Message, state: MessageState) -> MessageConfirmation {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.inner.send(message, state).await
    }

    async fn shutdown(&self) {}
}

struct Harness {
    router: Arc<MessageRouter>,
    module: Arc<Module>,
    frames: mpsc::UnboundedReceiver<(Identifier, String)>,
    module_sends: Arc<AtomicUsize>,
}

impl Harness {
    async fn next_frame(&mut self) -> RpcFrame {
        let (_, text) = tokio::time::timeout(Duration::from_secs(2), self.frames.recv())
            .await
            .expect("no frame sent to the station")
            .expect("network closed");
        RpcFrame::parse(&text).unwrap()
    }

    async fn assert_silent(&mut self) {
        let extra = tokio::time::timeout(Duration::from_millis(200), self.frames.recv()).await;
        assert!(extra.is_err(), "unexpected frame: {:?}", extra);
    }
}

fn station() -> Identifier {
    Identifier::new("t1", "CS001")
}

fn handlers() -> HandlerTable {
    HandlerTable::builder()
        .on(OcppVersion::Ocpp201, "Heartbeat", |module: Arc<Module>, message: Message| async move {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            module
                .send_call_result_with_message(&message, json!({ "currentTime": now }))
                .await;
            Ok(())
        })
        .on(OcppVersion::Ocpp201, "BootNotification", |_, _| async {
            Err::<(), _>(DispatchError::handler("registry offline"))
        })
        .on(OcppVersion::Ocpp201, "DataTransfer", |_, _| async {
            Err::<(), _>(DispatchError::handler("vendor backend down"))
        })
        .build()
}

async fn harness() -> Harness {
    harness_with(handlers()).await
}

async fn harness_with(handlers: HandlerTable) -> Harness {
    let config = ConfigHandle::new(SystemConfig::default(), None).unwrap();
    let cache: Arc<dyn Cache> = MemoryCache::shared();
    let bus = LocalBus::new();
    let (tx, frames) = mpsc::unbounded_channel();

    let router = MessageRouter::new(
        config.clone(),
        cache.clone(),
        Arc::new(OcppValidator::bundled().unwrap()),
        Arc::new(bus.sender()),
        Arc::new(bus.handler()),
        Arc::new(RecordingNetwork { tx }),
    )
    .await
    .unwrap();

    let module_sends = Arc::new(AtomicUsize::new(0));
    let module = Module::init(
        ModuleSpec::new(EventGroup::Configuration)
            .with_requests(["BootNotification", "Heartbeat", "StatusNotification"])
            .with_responses(["DataTransfer"]),
        handlers,
        config,
        cache,
        Arc::new(CountingSender {
            inner: bus.sender(),
            sends: module_sends.clone(),
        }),
        Arc::new(bus.handler()),
    )
    .await
    .unwrap();

    Harness {
        router,
        module,
        frames,
        module_sends,
    }
}

#[tokio::test]
async fn test_heartbeat_round_trip() {
    let mut h = harness().await;
    assert!(h.router.register_connection(&station(), OcppVersion::Ocpp201).await);

    let accepted = h
        .router
        .on_message(&station(), r#"[2,"123","Heartbeat",{}]"#, Utc::now(), "ocpp2.0.1")
        .await;
    assert!(accepted);

    match h.next_frame().await {
        RpcFrame::CallResult(result) => {
            assert_eq!(result.message_id, "123");
            let current = result.payload["currentTime"].as_str().unwrap();
            assert!(DateTime::parse_from_rfc3339(current).is_ok());
        }
        other => panic!("Expected CallResult, got {:?}", other),
    }

    // The answered call no longer blocks the next one
    assert!(
        h.router
            .on_message(&station(), r#"[2,"124","Heartbeat",{}]"#, Utc::now(), "ocpp2.0.1")
            .await
    );
    assert_eq!(h.next_frame().await.message_id(), "124");
}

#[tokio::test]
async fn test_unsupported_action_answers_not_supported() {
    let mut h = harness().await;
    h.router.register_connection(&station(), OcppVersion::Ocpp201).await;

    let frame = json!([2, "55", "StatusNotification", {
        "timestamp": "2026-01-20T12:00:00Z",
        "connectorStatus": "Available",
        "evseId": 1,
        "connectorId": 1
    }]);
    assert!(
        h.router
            .on_message(&station(), &frame.to_string(), Utc::now(), "ocpp2.0.1")
            .await
    );

    match h.next_frame().await {
        RpcFrame::CallError(error) => {
            assert_eq!(error.message_id, "55");
            assert_eq!(error.error_code, ErrorCode::NotSupported);
        }
        other => panic!("Expected CallError, got {:?}", other),
    }
    h.assert_silent().await;
}

#[tokio::test]
async fn test_request_failure_answers_once() {
    let mut h = harness().await;
    h.router.register_connection(&station(), OcppVersion::Ocpp201).await;

    let frame = json!([2, "b-1", "BootNotification", {
        "reason": "PowerUp",
        "chargingStation": {"model": "EK3", "vendorName": "Elektrokombinacija"}
    }]);
    assert!(
        h.router
            .on_message(&station(), &frame.to_string(), Utc::now(), "ocpp2.0.1")
            .await
    );

    match h.next_frame().await {
        RpcFrame::CallError(error) => {
            assert_eq!(error.message_id, "b-1");
            assert_eq!(error.error_code, ErrorCode::InternalError);
            assert!(error.error_description.contains("registry offline"));
        }
        other => panic!("Expected CallError, got {:?}", other),
    }
    h.assert_silent().await;
}

#[tokio::test]
async fn test_response_failure_answers_nothing() {
    let mut h = harness().await;
    h.router.register_connection(&station(), OcppVersion::Ocpp201).await;

    let confirmation = h
        .module
        .send_call(
            OutboundCall::new(station(), OcppVersion::Ocpp201, "DataTransfer", json!({"vendorId": "acme"}))
                .with_correlation_id("dt-1"),
        )
        .await;
    assert!(confirmation.success);

    match h.next_frame().await {
        RpcFrame::Call(call) => {
            assert_eq!(call.message_id, "dt-1");
            assert_eq!(call.action, "DataTransfer");
        }
        other => panic!("Expected Call, got {:?}", other),
    }

    assert!(
        h.router
            .on_message(&station(), r#"[3,"dt-1",{"status":"Accepted"}]"#, Utc::now(), "ocpp2.0.1")
            .await
    );

    let change = h
        .module
        .wait_for_response(&station(), "dt-1", Some(Duration::from_secs(2)))
        .await;
    let stored: Value = match change {
        CacheChange::Updated(value) => serde_json::from_str(&value).unwrap(),
        other => panic!("Expected stored response, got {:?}", other),
    };
    assert_eq!(stored, json!({"status": "Accepted"}));

    // The handler failed on a response: nothing goes back to the station
    h.assert_silent().await;
    assert_eq!(h.module_sends.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_protocol_mismatch_does_not_publish() {
    let mut h = harness().await;
    h.router.register_connection(&station(), OcppVersion::Ocpp16).await;

    let confirmation = h
        .module
        .send_call(OutboundCall::new(
            station(),
            OcppVersion::Ocpp201,
            "DataTransfer",
            json!({"vendorId": "acme"}),
        ))
        .await;

    assert!(!confirmation.success);
    let reason = confirmation.reason().unwrap();
    assert!(reason.contains("ocpp1.6"));
    assert!(reason.contains("ocpp2.0.1"));
    assert_eq!(h.module_sends.load(Ordering::SeqCst), 0);
    h.assert_silent().await;
}

#[tokio::test]
async fn test_invalid_frames_fail_fast() {
    let mut h = harness().await;
    h.router.register_connection(&station(), OcppVersion::Ocpp16).await;

    assert!(
        !h.router
            .on_message(&station(), r#"[2,"9","BootNotification",{}]"#, Utc::now(), "ocpp1.6")
            .await
    );
    match h.next_frame().await {
        RpcFrame::CallError(error) => {
            assert_eq!(error.message_id, "9");
            assert_eq!(error.error_code, ErrorCode::FormationViolation);
            assert!(error.error_details["errors"].as_array().is_some_and(|e| !e.is_empty()));
        }
        other => panic!("Expected CallError, got {:?}", other),
    }

    assert!(!h.router.on_message(&station(), "not json", Utc::now(), "ocpp1.6").await);
    match h.next_frame().await {
        RpcFrame::CallError(error) => {
            assert_eq!(error.message_id, "-1");
            assert_eq!(error.error_code, ErrorCode::RpcFrameworkError);
        }
        other => panic!("Expected CallError, got {:?}", other),
    }

    assert!(!h.router.on_message(&station(), r#"[7,"x",{}]"#, Utc::now(), "ocpp1.6").await);
    match h.next_frame().await {
        RpcFrame::CallError(error) => {
            assert_eq!(error.message_id, "x");
            assert_eq!(error.error_code, ErrorCode::MessageTypeNotSupported);
        }
        other => panic!("Expected CallError, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unmatched_result_is_dropped() {
    let mut h = harness().await;
    h.router.register_connection(&station(), OcppVersion::Ocpp201).await;

    assert!(
        !h.router
            .on_message(&station(), r#"[3,"nobody",{}]"#, Utc::now(), "ocpp2.0.1")
            .await
    );
    h.assert_silent().await;
}

#[tokio::test]
async fn test_blacklisted_action_is_refused() {
    let mut h = harness().await;
    h.router.register_connection(&station(), OcppVersion::Ocpp201).await;

    let actions = h.router.validator().actions(OcppVersion::Ocpp201);
    h.router
        .blacklist()
        .blacklist_all_except_boot(&station(), &actions)
        .await;

    assert!(
        !h.router
            .on_message(&station(), r#"[2,"hb","Heartbeat",{}]"#, Utc::now(), "ocpp2.0.1")
            .await
    );
    match h.next_frame().await {
        RpcFrame::CallError(error) => assert_eq!(error.error_code, ErrorCode::SecurityError),
        other => panic!("Expected CallError, got {:?}", other),
    }

    h.router.blacklist().clear(&station(), &actions).await;
    assert!(
        h.router
            .on_message(&station(), r#"[2,"hb2","Heartbeat",{}]"#, Utc::now(), "ocpp2.0.1")
            .await
    );
    assert!(matches!(h.next_frame().await, RpcFrame::CallResult(_)));
}

#[tokio::test]
async fn test_second_call_while_first_in_flight() {
    let slow = HandlerTable::builder()
        .on(OcppVersion::Ocpp201, "Heartbeat", |_, _| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<(), DispatchError>(())
        })
        .build();
    let mut h = harness_with(slow).await;
    h.router.register_connection(&station(), OcppVersion::Ocpp201).await;

    assert!(
        h.router
            .on_message(&station(), r#"[2,"h-1","Heartbeat",{}]"#, Utc::now(), "ocpp2.0.1")
            .await
    );
    assert!(
        !h.router
            .on_message(&station(), r#"[2,"h-2","Heartbeat",{}]"#, Utc::now(), "ocpp2.0.1")
            .await
    );
    match h.next_frame().await {
        RpcFrame::CallError(error) => {
            assert_eq!(error.message_id, "h-2");
            assert_eq!(error.error_code, ErrorCode::RpcFrameworkError);
        }
        other => panic!("Expected CallError, got {:?}", other),
    }
}

#[tokio::test]
async fn test_call_without_subscriber_is_not_supported() {
    let mut h = harness().await;
    h.router.register_connection(&station(), OcppVersion::Ocpp201).await;

    // Only DataTransfer responses are subscribed, not station requests
    assert!(
        !h.router
            .on_message(
                &station(),
                r#"[2,"d-1","DataTransfer",{"vendorId":"acme"}]"#,
                Utc::now(),
                "ocpp2.0.1"
            )
            .await
    );
    match h.next_frame().await {
        RpcFrame::CallError(error) => {
            assert_eq!(error.message_id, "d-1");
            assert_eq!(error.error_code, ErrorCode::NotSupported);
            assert_eq!(error.error_details["action"], "DataTransfer");
        }
        other => panic!("Expected CallError, got {:?}", other),
    }

    // The refused call does not hold the station's in-flight slot
    assert!(
        h.router
            .on_message(&station(), r#"[2,"h-1","Heartbeat",{}]"#, Utc::now(), "ocpp2.0.1")
            .await
    );
    match h.next_frame().await {
        RpcFrame::CallResult(result) => assert_eq!(result.message_id, "h-1"),
        other => panic!("Expected CallResult, got {:?}", other),
    }
}

#[tokio::test]
async fn test_dead_station_does_not_silence_others() {
    let mut h = harness().await;
    let gone = Identifier::new("t1", "GONE");
    h.router.register_connection(&gone, OcppVersion::Ocpp201).await;
    h.router.register_connection(&station(), OcppVersion::Ocpp201).await;

    let threshold = SystemConfig::default().breaker.failure_threshold;
    for _ in 0..threshold + 2 {
        assert!(!h.router.on_message(&gone, "not json", Utc::now(), "ocpp2.0.1").await);
    }
    h.assert_silent().await;

    assert!(!h.router.on_message(&station(), "not json", Utc::now(), "ocpp2.0.1").await);
    match h.next_frame().await {
        RpcFrame::CallError(error) => {
            assert_eq!(error.message_id, "-1");
            assert_eq!(error.error_code, ErrorCode::RpcFrameworkError);
        }
        other => panic!("Expected CallError, got {:?}", other),
    }
}

#[tokio::test]
async fn test_deregistered_station_is_unreachable() {
    let h = harness().await;
    h.router.register_connection(&station(), OcppVersion::Ocpp201).await;
    assert!(h.router.deregister_connection(&station()).await);

    let confirmation = h
        .module
        .send_call(OutboundCall::new(
            station(),
            OcppVersion::Ocpp201,
            "DataTransfer",
            json!({"vendorId": "acme"}),
        ))
        .await;
    assert!(!confirmation.success);
    assert!(confirmation.reason().unwrap().contains("No connection"));
}
