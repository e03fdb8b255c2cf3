use super::*;
use crate::action::{handler_fn, registry, ActionDefinition};
use crate::session::SessionType;
use crate::telemetry::{RequestStatus, SpanKind};
use crate::testing::{RecordingLockProvider, RecordingMetrics, RecordingTracer};
use crate::types::{ApiError, ErrorType, ObjectId};
use pretty_assertions::assert_eq;
use serde_json::json;
use tracing_test::traced_test;

struct Harness {
    executor: ActionExecutor,
    metrics: Arc<RecordingMetrics>,
    tracer: Arc<RecordingTracer>,
    locks: Arc<RecordingLockProvider>,
}

fn harness() -> Harness {
    harness_with_locks(RecordingLockProvider::new())
}

fn harness_with_locks(locks: Arc<RecordingLockProvider>) -> Harness {
    let metrics = RecordingMetrics::new();
    let tracer = RecordingTracer::new();
    let executor = ActionExecutor::new("documents")
        .with_metrics(metrics.clone())
        .with_tracer(tracer.clone())
        .with_lock_provider(locks.clone());
    Harness {
        executor,
        metrics,
        tracer,
        locks,
    }
}

fn context(transport: Transport, name: &str, envelope: Value) -> InvocationContext {
    InvocationContext {
        action: ActionRef {
            name: Some(format!("documents.{name}")),
            raw_name: name.to_string(),
            service: Some("documents".to_string()),
        },
        caller: None,
        params: envelope,
        transport,
        tracing: None,
    }
}

fn echo() -> ActionDefinition {
    ActionDefinition::new(
        "echo",
        SessionType::None,
        handler_fn(|args| async move {
            Ok(Document::from(args.params["value"].as_str().unwrap_or_default().to_string()))
        }),
    )
    .with_params_rules(json!({
        "type": "object",
        "properties": { "value": { "type": "string" } },
        "required": ["value"],
    }))
}

fn rules(action: &ActionDefinition) -> ValidationRules {
    registry::validation_rules(action).unwrap()
}

#[tokio::test]
async fn echo_succeeds_with_one_observation_and_closed_span() {
    let h = harness();
    let action = echo();

    let out = h
        .executor
        .execute(
            context(Transport::Bus, "echo", json!({ "params": { "value": "a" } })),
            &rules(&action),
            &action,
        )
        .await
        .unwrap();

    assert_eq!(out, Some(Document::from("a")));

    let observations = h.metrics.observations();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0].labels.status, RequestStatus::Successful);
    assert_eq!(observations[0].labels.route, "documents.echo");
    assert_eq!(observations[0].labels.destination, "documents");

    let spans = h.tracer.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "handle documents.echo");
    assert_eq!(spans[0].kind, SpanKind::Consumer);
    assert_eq!(spans[0].ended, 1);
    assert!(spans[0].exceptions.is_empty());
}

#[tokio::test]
async fn missing_action_name_is_a_no_op() {
    let h = harness();
    let action = echo();
    let mut ctx = context(Transport::Bus, "echo", json!({}));
    ctx.action.name = None;

    let out = h.executor.execute(ctx, &rules(&action), &action).await.unwrap();

    assert_eq!(out, None);
    assert!(h.metrics.observations().is_empty());
    assert!(h.tracer.spans().is_empty());
}

#[tokio::test]
async fn validation_failure_never_reaches_handler() {
    let h = harness();
    let reached = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = reached.clone();
    let action = ActionDefinition::new(
        "echo",
        SessionType::None,
        handler_fn(move |_args| {
            let flag = flag.clone();
            async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(Document::Null)
            }
        }),
    )
    .with_params_rules(json!({ "type": "object", "required": ["value"] }));

    let err = h
        .executor
        .execute(
            context(Transport::Rpc, "echo", json!({ "params": {} })),
            &rules(&action),
            &action,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert!(!reached.load(std::sync::atomic::Ordering::SeqCst));

    let observations = h.metrics.observations();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0].labels.status, RequestStatus::Failed);
    assert_eq!(observations[0].labels.status_code, Some(422));

    let spans = h.tracer.spans();
    assert_eq!(spans[0].kind, SpanKind::Server);
    assert_eq!(spans[0].exceptions.len(), 1);
    assert_eq!(spans[0].exceptions[0].code, 422);
    assert_eq!(spans[0].ended, 1);
}

#[tokio::test]
async fn bus_applies_defaults_before_validating() {
    let h = harness();
    let action = ActionDefinition::new(
        "list",
        SessionType::None,
        handler_fn(|args| async move { Ok(Document::from(args.params)) }),
    )
    .with_params_rules(json!({
        "type": "object",
        "properties": { "limit": { "type": "integer", "default": 10 } },
        "required": ["limit"],
    }));

    let out = h
        .executor
        .execute(
            context(Transport::Bus, "list", json!({ "params": {} })),
            &rules(&action),
            &action,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out.to_json(), json!({ "limit": 10 }));

    // RPC validates the raw envelope first, so the same call is rejected.
    let err = h
        .executor
        .execute(
            context(Transport::Rpc, "list", json!({ "params": {} })),
            &rules(&action),
            &action,
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 422);
}

#[tokio::test]
async fn handler_error_is_recorded_with_its_status() {
    let h = harness();
    let action = ActionDefinition::new(
        "getDocument",
        SessionType::None,
        handler_fn(|_args| async {
            Err(ApiError::new("document not found", 404)
                .with_process_code(1_016_001)
                .into())
        }),
    );

    let err = h
        .executor
        .execute(
            context(Transport::Rpc, "getDocument", json!({ "params": {} })),
            &rules(&action),
            &action,
        )
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), 404);
    let labels = &h.metrics.observations()[0].labels;
    assert_eq!(labels.status, RequestStatus::Failed);
    assert_eq!(labels.status_code, Some(404));
    assert_eq!(labels.error_type, Some(ErrorType::Operated));

    let span = &h.tracer.spans()[0];
    assert_eq!(span.exceptions[0].name, "ApiError");
    assert_eq!(span.exceptions[0].message, "document not found");
    assert_eq!(span.ended, 1);
}

fn locked_action(fail: bool) -> ActionDefinition {
    ActionDefinition::new(
        "sign",
        SessionType::None,
        handler_fn(move |_args| async move {
            if fail {
                Err(Error::api("signature rejected", 400))
            } else {
                Ok(Document::from(true))
            }
        }),
    )
    .with_lock_resource(|args| args.params["documentId"].as_str().unwrap_or_default().to_string())
}

#[tokio::test]
async fn lock_is_released_exactly_once() {
    for fail in [false, true] {
        let h = harness();
        let action = locked_action(fail);

        let result = h
            .executor
            .execute(
                context(Transport::Bus, "sign", json!({ "params": { "documentId": "doc-1" } })),
                &rules(&action),
                &action,
            )
            .await;

        assert_eq!(result.is_err(), fail);
        assert_eq!(
            h.locks.acquired(),
            vec![("sign.doc-1".to_string(), DEFAULT_LOCK_TTL)]
        );
        assert_eq!(h.locks.release_calls(), 1, "fail={fail}");
    }
}

#[tokio::test]
async fn empty_lock_resource_skips_locking() {
    let h = harness();
    let action = locked_action(false);

    let out = h
        .executor
        .execute(
            context(Transport::Bus, "sign", json!({ "params": {} })),
            &rules(&action),
            &action,
        )
        .await
        .unwrap();

    assert_eq!(out, Some(Document::from(true)));
    assert!(h.locks.acquired().is_empty());
    assert_eq!(h.locks.release_calls(), 0);
}

#[tokio::test]
async fn elapsed_deadline_is_recorded_and_releases_lock() {
    let h = harness();
    let action = ActionDefinition::new(
        "sign",
        SessionType::None,
        handler_fn(|_args| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Document::Null)
        }),
    )
    .with_lock_resource(|_| "doc-1".to_string());

    let err = h
        .executor
        .execute_within(
            context(Transport::Rpc, "sign", json!({ "params": {} })),
            &rules(&action),
            &action,
            Some(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::DeadlineExceeded(_)));
    assert_eq!(err.to_string(), "deadline exceeded: documents.sign exceeded 20ms");

    let observations = h.metrics.observations();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0].labels.status, RequestStatus::Failed);
    assert_eq!(observations[0].labels.status_code, Some(504));

    let span = &h.tracer.spans()[0];
    assert_eq!(span.exceptions[0].name, "DeadlineExceededError");
    assert_eq!(span.ended, 1);
    assert_eq!(h.locks.release_calls(), 1);
}

#[tokio::test]
async fn lock_unavailable_fails_the_invocation() {
    let h = harness_with_locks(RecordingLockProvider::unavailable());
    let action = locked_action(false);

    let err = h
        .executor
        .execute(
            context(Transport::Bus, "sign", json!({ "params": { "documentId": "doc-1" } })),
            &rules(&action),
            &action,
        )
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), 503);
    assert_eq!(h.locks.release_calls(), 0);
    let observations = h.metrics.observations();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0].labels.status_code, Some(503));
    assert_eq!(h.tracer.spans()[0].ended, 1);
}

#[tokio::test]
async fn panicking_handler_releases_lock() {
    let h = harness();
    let action = ActionDefinition::new(
        "sign",
        SessionType::None,
        handler_fn(|args| async move {
            if args.params.is_object() {
                panic!("boom");
            }
            Ok(Document::Null)
        }),
    )
    .with_lock_resource(|_| "doc-1".to_string());

    let err = h
        .executor
        .execute(
            context(Transport::Bus, "sign", json!({ "params": {} })),
            &rules(&action),
            &action,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Internal(ref m) if m.contains("boom")));
    assert_eq!(h.locks.release_calls(), 1);
}

#[tokio::test]
async fn unknown_session_type_raises_and_is_recorded() {
    let h = harness();
    let action = echo();

    let err = h
        .executor
        .execute(
            context(
                Transport::Bus,
                "echo",
                json!({ "params": { "value": "a" }, "session": { "sessionType": "Robot" } }),
            ),
            &rules(&action),
            &action,
        )
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "Unexpected sessionType: Robot");
    assert_eq!(h.metrics.observations()[0].labels.status_code, Some(500));
    assert_eq!(h.tracer.spans()[0].exceptions.len(), 1);
}

#[tokio::test]
async fn identifiers_are_encoded_for_bus_only() {
    let h = harness();
    let id = ObjectId::parse_str("63fda9ec38f6a88647048a2c").unwrap();
    let action = ActionDefinition::new(
        "create",
        SessionType::None,
        handler_fn(move |_args| async move { Ok(Document::object([("_id", id)])) }),
    );

    let bus = h
        .executor
        .execute(context(Transport::Bus, "create", json!({})), &rules(&action), &action)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        bus.to_json(),
        json!({ "_id": { "$objectId": "63fda9ec38f6a88647048a2c" } })
    );

    let rpc = h
        .executor
        .execute(context(Transport::Rpc, "create", json!({})), &rules(&action), &action)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rpc.get("_id").and_then(Document::as_object_id), Some(id));
}

#[tokio::test]
async fn service_code_is_written_into_headers() {
    let h = harness();
    let action = ActionDefinition::new(
        "apply",
        SessionType::None,
        handler_fn(|args| async move {
            Ok(Document::from(
                args.headers.and_then(|h| h.service_code).unwrap_or_default(),
            ))
        }),
    )
    .with_service_code(|_| "residence-permit".to_string());

    let out = h
        .executor
        .execute(
            context(
                Transport::Bus,
                "apply",
                json!({ "params": {}, "headers": { "traceId": "t-1" } }),
            ),
            &rules(&action),
            &action,
        )
        .await
        .unwrap();
    assert_eq!(out, Some(Document::from("residence-permit")));
}

#[tokio::test]
async fn session_rule_rejects_account_without_id() {
    let h = harness();
    let action = ActionDefinition::new(
        "pay",
        SessionType::Partner,
        handler_fn(|_args| async { Ok(Document::Null) }),
    );

    let err = h
        .executor
        .execute(
            context(
                Transport::Bus,
                "pay",
                json!({ "params": {}, "session": { "sessionType": "Partner", "partner": {} } }),
            ),
            &rules(&action),
            &action,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_context_does_not_leak_between_invocations() {
    let h = harness();
    let action = Arc::new(ActionDefinition::new(
        "whoami",
        SessionType::User,
        handler_fn(|_args| async {
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(1)).await;
            let ctx = RequestContext::current()
                .ok_or_else(|| Error::internal("no request context"))?;
            Ok(Document::from(ctx.log_fields.user_identifier.clone()))
        }),
    ));
    let rules = Arc::new(rules(&action));
    let executor = Arc::new(h.executor);

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let executor = executor.clone();
            let action = action.clone();
            let rules = rules.clone();
            tokio::spawn(async move {
                let envelope = json!({
                    "params": {},
                    "session": { "sessionType": "User", "user": { "identifier": format!("user-{i}") } }
                });
                let out = executor
                    .execute(context(Transport::Bus, "whoami", envelope), &rules, &action)
                    .await
                    .unwrap()
                    .unwrap();
                (i, out)
            })
        })
        .collect();

    for task in tasks {
        let (i, out) = task.await.unwrap();
        assert_eq!(out, Document::from(format!("user-{i}")));
    }
    assert!(RequestContext::current().is_none());
}

#[traced_test]
#[tokio::test]
async fn logs_inbound_call_and_result() {
    let h = harness();
    let action = echo();

    h.executor
        .execute(
            context(Transport::Bus, "echo", json!({ "params": { "value": "a" } })),
            &rules(&action),
            &action,
        )
        .await
        .unwrap();

    assert!(logs_contain("ACT IN: documents.echo"));
    assert!(logs_contain("ACT IN RESULT: documents.echo"));
}

#[tokio::test]
async fn outbound_spans_join_the_inbound_trace() {
    use crate::telemetry::Mechanism;
    use tracing_subscriber::registry::{LookupSpan, Registry};

    let _subscriber = tracing::subscriber::set_default(tracing_subscriber::registry());
    let executor = ActionExecutor::new("documents").with_metrics(RecordingMetrics::new());
    let action = ActionDefinition::new(
        "relay",
        SessionType::None,
        handler_fn(|_args| async {
            let outbound = TracingTracer.start_span(SpanOptions::new(
                "send billing.charge",
                SpanKind::Producer,
                Mechanism::Bus,
            ));
            let ancestry = outbound
                .tracing_span()
                .with_subscriber(|(id, dispatch)| {
                    dispatch
                        .downcast_ref::<Registry>()
                        .and_then(|registry| registry.span(id))
                        .map(|span| span.scope().map(|s| s.name()).collect::<Vec<_>>())
                })
                .flatten()
                .unwrap_or_default();
            Ok(Document::from(json!(ancestry)))
        }),
    );

    let out = executor
        .execute(
            context(Transport::Bus, "relay", json!({ "params": {} })),
            &rules(&action),
            &action,
        )
        .await
        .unwrap()
        .unwrap();

    // outbound span → request span → inbound `handle` span (root)
    assert_eq!(out.to_json(), json!(["action", "request", "action"]));
}
