//! Outbound action calls to other services over the bus.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{BusAction, BusCall, BusEnvelope, BusMeta, BusService, MessageBus};
use crate::action::{route_key, ActionVersion};
use crate::codec::{self, Document};
use crate::dispatch::RequestContext;
use crate::telemetry::{
    ExceptionEvent, Mechanism, MetricsFacade, MetricsSink, RequestLabels, RequestTimer, SpanKind,
    SpanOptions, Tracer, TracingCarrier, TracingTracer,
};
use crate::types::{Error, Result};

/// Target action of an outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallAction {
    pub name: String,
    pub version: Option<ActionVersion>,
}

impl CallAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<ActionVersion>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn route_key(&self) -> String {
        route_key(&self.name, self.version.as_ref())
    }
}

impl From<&str> for CallAction {
    /// Parses `name` or `name@version`.
    fn from(s: &str) -> Self {
        match s.split_once('@') {
            Some((name, version)) => CallAction::new(name).with_version(version),
            None => CallAction::new(s),
        }
    }
}

/// Arguments of an outbound call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArguments {
    pub params: Value,
    pub session: Option<Value>,
    pub headers: Option<Map<String, Value>>,
}

impl CallArguments {
    pub fn new(params: Value) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session: Value) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_headers(mut self, headers: Map<String, Value>) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// Calls actions exposed by other services on the bus.
#[derive(Debug, Clone)]
pub struct BusClient {
    bus: Arc<MessageBus>,
    service_name: String,
    metrics: Arc<dyn MetricsSink>,
    tracer: Arc<dyn Tracer>,
    timeout: Duration,
}

impl BusClient {
    pub fn new(bus: Arc<MessageBus>, service_name: impl Into<String>) -> Self {
        Self {
            bus,
            service_name: service_name.into(),
            metrics: Arc::new(MetricsFacade),
            tracer: Arc::new(TracingTracer),
            timeout: Duration::ZERO,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Per-call timeout. Zero uses the bus default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Call `service.action` and decode identifiers in the result.
    pub async fn act(
        &self,
        service: &str,
        action: impl Into<CallAction>,
        args: CallArguments,
    ) -> Result<Document> {
        let action = action.into();
        let started = Instant::now();
        let key = action.route_key();
        let route = format!("{service}.{key}");

        let mut span = self.tracer.start_span(
            SpanOptions::new(
                format!("send {route}"),
                SpanKind::Producer,
                Mechanism::Bus,
            )
            .with_caller(Some(self.service_name.clone())),
        );
        let mut carrier = TracingCarrier::new();
        span.inject(&mut carrier);

        let labels = RequestLabels::new(
            Mechanism::Bus,
            Some(self.service_name.clone()),
            service,
            route.clone(),
        );

        let headers = outbound_headers(args.headers);
        let mut params = json!({ "params": args.params, "headers": headers });
        if let Some(session) = args.session {
            params["session"] = session;
        }

        tracing::info!(
            service,
            action = %action.name,
            version = action.version.as_ref().map(ActionVersion::as_str),
            params = %params["params"],
            "ACT OUT: {}",
            route
        );

        let outcome = self.send(service, &key, &route, params, carrier).await;
        let elapsed = started.elapsed();
        match &outcome {
            Ok(doc) => {
                tracing::info!(result = %doc.to_json(), "ACT OUT RESULT: {}", route);
                self.metrics
                    .observe(RequestTimer::Outbound, &labels.succeeded(), elapsed);
            }
            Err(err) => {
                tracing::error!(error = %err, "ACT OUT FAILED: {}", route);
                self.metrics
                    .observe(RequestTimer::Outbound, &labels.failed(err), elapsed);
                span.record_exception(&ExceptionEvent::from(err));
            }
        }
        span.end();
        outcome
    }

    /// Like [`act`](Self::act), but failures yield `None`.
    pub async fn try_to_act(
        &self,
        service: &str,
        action: impl Into<CallAction>,
        args: CallArguments,
    ) -> Option<Document> {
        self.act(service, action, args).await.ok()
    }

    async fn send(
        &self,
        service: &str,
        key: &str,
        route: &str,
        params: Value,
        carrier: TracingCarrier,
    ) -> Result<Document> {
        let envelope = BusEnvelope {
            action: BusAction {
                name: Some(route.to_string()),
                raw_name: key.to_string(),
                service: BusService {
                    name: Some(service.to_string()),
                },
            },
            caller: Some(self.service_name.clone()),
            params,
            meta: Some(BusMeta {
                tracing: Some(carrier),
            }),
        };
        let call = BusCall {
            action: route.to_string(),
            payload: serde_json::to_vec(&envelope)?,
            timeout_ms: self.timeout.as_millis().try_into().unwrap_or(u64::MAX),
            source: self.service_name.clone(),
        };

        let reply = self.bus.call(call).await?;
        if !reply.success {
            return Err(match reply.error {
                Some(api) => Error::Api(api),
                None => Error::internal(format!("call to {route} failed without error")),
            });
        }
        let value: Value = serde_json::from_slice(&reply.result)?;
        Ok(codec::decode_json(value))
    }
}

/// Log fields of the current invocation, overridden by explicit headers.
fn outbound_headers(explicit: Option<Map<String, Value>>) -> Map<String, Value> {
    let mut headers = RequestContext::current()
        .and_then(|ctx| match serde_json::to_value(&ctx.log_fields) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        })
        .unwrap_or_default();
    if let Some(explicit) = explicit {
        headers.extend(explicit);
    }
    headers
}
