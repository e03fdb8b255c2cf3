//! Bus integration tests: client → bus → adapter → executor → reply.

use action_gateway::action::{handler_fn, register, ActionDefinition};
use action_gateway::bus::{BusAdapter, BusClient, CallArguments, MessageBus};
use action_gateway::codec::Document;
use action_gateway::dispatch::{ActionExecutor, RequestContext};
use action_gateway::lock::{LockProvider, DEFAULT_LOCK_TTL};
use action_gateway::session::SessionType;
use action_gateway::telemetry::{RequestStatus, RequestTimer, SpanKind};
use action_gateway::testing::{RecordingLockProvider, RecordingMetrics, RecordingTracer};
use action_gateway::types::{ApiError, ObjectId};
use action_gateway::Error;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

struct Harness {
    bus: Arc<MessageBus>,
    adapter: BusAdapter,
    metrics: Arc<RecordingMetrics>,
    tracer: Arc<RecordingTracer>,
    locks: Arc<RecordingLockProvider>,
}

fn actions() -> Vec<ActionDefinition> {
    let echo = ActionDefinition::new(
        "echo",
        SessionType::None,
        handler_fn(|args| async move {
            Ok(Document::from(args.params.get("value").cloned().unwrap_or_default()))
        }),
    )
    .with_params_rules(json!({
        "type": "object",
        "properties": { "value": { "type": "string", "default": "fallback" } }
    }));

    let sign = ActionDefinition::new(
        "sign",
        SessionType::User,
        handler_fn(|args| async move {
            let id = args.params["id"].as_str().unwrap_or_default().to_string();
            if id == "broken" {
                return Err(Error::from(ApiError::new("cannot sign", 409)));
            }
            Ok(Document::object([
                ("id", Document::from(id)),
                ("receipt", Document::ObjectId(ObjectId::from_bytes([1; 12]))),
            ]))
        }),
    )
    .with_lock_resource(|args| args.params["id"].as_str().unwrap_or_default().to_string());

    // Reports the log fields bound to its invocation.
    let relay = ActionDefinition::new(
        "relay",
        SessionType::User,
        handler_fn(|args| async move {
            let caller_fields = RequestContext::current().map(|ctx| ctx.log_fields.clone());
            Ok(Document::from(json!({
                "userIdentifier": caller_fields.and_then(|f| f.user_identifier),
                "params": args.params,
            })))
        }),
    );

    vec![echo, sign, relay]
}

async fn harness() -> Harness {
    let bus = Arc::new(MessageBus::default());
    let metrics = RecordingMetrics::new();
    let tracer = RecordingTracer::new();
    let locks = RecordingLockProvider::new();

    let routes = Arc::new(register(actions(), Some(&*locks as &dyn LockProvider)).unwrap());
    let executor = Arc::new(
        ActionExecutor::new("documents")
            .with_metrics(metrics.clone())
            .with_tracer(tracer.clone())
            .with_lock_provider(locks.clone()),
    );
    let adapter = BusAdapter::new(Arc::clone(&bus), executor, routes);
    adapter.start().await.unwrap();

    Harness {
        bus,
        adapter,
        metrics,
        tracer,
        locks,
    }
}

fn user_session() -> serde_json::Value {
    json!({ "sessionType": "User", "user": { "identifier": "u-1" } })
}

#[tokio::test]
async fn test_echo_round_trip_applies_defaults() {
    let h = harness().await;
    let client = BusClient::new(Arc::clone(&h.bus), "gateway");

    let result = client
        .act("documents", "echo", CallArguments::new(json!({ "value": "a" })))
        .await
        .unwrap();
    assert_eq!(result, Document::from("a"));

    let defaulted = client
        .act("documents", "echo", CallArguments::new(json!({})))
        .await
        .unwrap();
    assert_eq!(defaulted, Document::from("fallback"));

    let inbound: Vec<_> = h
        .metrics
        .observations()
        .into_iter()
        .filter(|o| o.timer == RequestTimer::Inbound)
        .collect();
    assert_eq!(inbound.len(), 2);
    assert!(inbound.iter().all(|o| o.labels.status == RequestStatus::Successful));

    h.adapter.stop().await.unwrap();
}

#[tokio::test]
async fn test_locked_action_decodes_identifiers() {
    let h = harness().await;
    let client = BusClient::new(Arc::clone(&h.bus), "gateway");

    let result = client
        .act(
            "documents",
            "sign",
            CallArguments::new(json!({ "id": "doc-1" })).with_session(user_session()),
        )
        .await
        .unwrap();

    assert_eq!(
        result.get("receipt").and_then(Document::as_object_id),
        Some(ObjectId::from_bytes([1; 12]))
    );
    assert_eq!(h.locks.acquired(), vec![("sign.doc-1".to_string(), DEFAULT_LOCK_TTL)]);
    assert_eq!(h.locks.release_calls(), 1);

    h.adapter.stop().await.unwrap();
}

#[tokio::test]
async fn test_handler_error_reaches_caller_and_releases_lock() {
    let h = harness().await;
    let client = BusClient::new(Arc::clone(&h.bus), "gateway");

    let err = client
        .act(
            "documents",
            "sign",
            CallArguments::new(json!({ "id": "broken" })).with_session(user_session()),
        )
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), 409);
    assert_eq!(err.to_string(), "cannot sign");
    assert_eq!(h.locks.release_calls(), 1);

    let failed = h
        .metrics
        .observations()
        .into_iter()
        .find(|o| o.timer == RequestTimer::Inbound)
        .unwrap();
    assert_eq!(failed.labels.status_code, Some(409));

    h.adapter.stop().await.unwrap();
}

#[tokio::test]
async fn test_trace_context_and_log_fields_cross_the_bus() {
    let h = harness().await;
    let client = BusClient::new(Arc::clone(&h.bus), "gateway").with_tracer(h.tracer.clone());

    let result = client
        .act(
            "documents",
            "relay",
            CallArguments::new(json!({ "n": 1 })).with_session(user_session()),
        )
        .await
        .unwrap();
    assert_eq!(result.to_json()["userIdentifier"], "u-1");

    let spans = h.tracer.spans();
    let producer = spans.iter().find(|s| s.kind == SpanKind::Producer).unwrap();
    let consumer = spans.iter().find(|s| s.kind == SpanKind::Consumer).unwrap();
    assert_eq!(producer.name, "send documents.relay");
    assert_eq!(consumer.name, "handle documents.relay");
    assert_eq!(consumer.caller.as_deref(), Some("gateway"));
    assert!(consumer
        .parent
        .as_ref()
        .is_some_and(|carrier| carrier.contains_key("traceparent")));

    h.adapter.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_session_type_is_raised() {
    let h = harness().await;
    let client = BusClient::new(Arc::clone(&h.bus), "gateway");

    let err = client
        .act(
            "documents",
            "relay",
            CallArguments::new(json!({})).with_session(json!({ "sessionType": "Robot" })),
        )
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), 500);
    assert!(err.to_string().contains("Unexpected sessionType: Robot"));

    h.adapter.stop().await.unwrap();
}
