//! Tracing spans and request metrics.
//!
//! The dispatch core and the outbound clients record through two contracts:
//! [`MetricsSink`] for latency observations and [`Tracer`] for spans. The
//! defaults forward to the `metrics` facade and to `tracing` spans (linked to
//! OpenTelemetry when the `otel` feature is enabled).

use metrics::{describe_histogram, histogram, Label};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::types::{Error, ErrorType};

/// Propagation carrier (W3C trace-context keys and values).
pub type TracingCarrier = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SpanKind::Server => "server",
            SpanKind::Client => "client",
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
        }
    }
}

/// Transport a request travelled over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Bus,
    Rpc,
}

impl Mechanism {
    pub fn as_str(self) -> &'static str {
        match self {
            Mechanism::Bus => "bus",
            Mechanism::Rpc => "rpc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Successful,
    Failed,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Successful => "successful",
            RequestStatus::Failed => "failed",
        }
    }
}

/// Label set of one timer observation.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestLabels {
    pub mechanism: Mechanism,
    pub source: Option<String>,
    pub destination: String,
    pub route: String,
    pub status: RequestStatus,
    pub error_type: Option<ErrorType>,
    pub status_code: Option<u16>,
}

impl RequestLabels {
    pub fn new(
        mechanism: Mechanism,
        source: Option<String>,
        destination: impl Into<String>,
        route: impl Into<String>,
    ) -> Self {
        Self {
            mechanism,
            source,
            destination: destination.into(),
            route: route.into(),
            status: RequestStatus::Successful,
            error_type: None,
            status_code: None,
        }
    }

    pub fn succeeded(&self) -> Self {
        Self {
            status: RequestStatus::Successful,
            error_type: None,
            status_code: None,
            ..self.clone()
        }
    }

    pub fn failed(&self, err: &Error) -> Self {
        Self {
            status: RequestStatus::Failed,
            error_type: Some(err.error_type()),
            status_code: Some(err.status_code()),
            ..self.clone()
        }
    }

    /// Labels as key/value pairs; absent optional labels are omitted.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("mechanism", self.mechanism.as_str().to_string())];
        if let Some(source) = &self.source {
            pairs.push(("source", source.clone()));
        }
        pairs.push(("destination", self.destination.clone()));
        pairs.push(("route", self.route.clone()));
        pairs.push(("status", self.status.as_str().to_string()));
        if let Some(error_type) = self.error_type {
            pairs.push(("errorType", error_type.as_str().to_string()));
        }
        if let Some(code) = self.status_code {
            pairs.push(("statusCode", code.to_string()));
        }
        pairs
    }
}

/// Which latency timer an observation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTimer {
    /// Handling of an inbound action call.
    Inbound,
    /// An outbound call made through a client.
    Outbound,
}

impl RequestTimer {
    pub fn metric_name(self) -> &'static str {
        match self {
            RequestTimer::Inbound => "gateway_response_total_duration_seconds",
            RequestTimer::Outbound => "gateway_client_request_duration_seconds",
        }
    }
}

/// Latency metric contract.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    fn observe(&self, timer: RequestTimer, labels: &RequestLabels, elapsed: Duration);
}

/// Forwards observations to the globally installed `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsFacade;

impl MetricsFacade {
    /// Register metric descriptions with the installed recorder.
    pub fn describe() {
        describe_histogram!(
            RequestTimer::Inbound.metric_name(),
            metrics::Unit::Seconds,
            "Time from action call arrival to response"
        );
        describe_histogram!(
            RequestTimer::Outbound.metric_name(),
            metrics::Unit::Seconds,
            "Duration of outbound action calls"
        );
    }
}

impl MetricsSink for MetricsFacade {
    fn observe(&self, timer: RequestTimer, labels: &RequestLabels, elapsed: Duration) {
        let labels: Vec<Label> = labels
            .pairs()
            .into_iter()
            .map(|(k, v)| Label::new(k, v))
            .collect();
        histogram!(timer.metric_name(), labels).record(elapsed.as_secs_f64());
    }
}

// =============================================================================
// Spans
// =============================================================================

/// Exception recorded on a span.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionEvent {
    pub name: String,
    pub code: u16,
    pub message: String,
}

impl From<&Error> for ExceptionEvent {
    fn from(err: &Error) -> Self {
        Self {
            name: err.name().to_string(),
            code: err.status_code(),
            message: err.to_string(),
        }
    }
}

/// Parameters of a new span.
#[derive(Debug, Clone)]
pub struct SpanOptions {
    pub name: String,
    pub kind: SpanKind,
    /// `messaging.system` attribute.
    pub mechanism: Mechanism,
    /// `messaging.caller` attribute.
    pub caller: Option<String>,
    /// Remote parent. Without one the span joins the current span's trace,
    /// or starts a fresh root outside any span.
    pub parent: Option<TracingCarrier>,
}

impl SpanOptions {
    pub fn new(name: impl Into<String>, kind: SpanKind, mechanism: Mechanism) -> Self {
        Self {
            name: name.into(),
            kind,
            mechanism,
            caller: None,
            parent: None,
        }
    }

    pub fn with_caller(mut self, caller: Option<String>) -> Self {
        self.caller = caller;
        self
    }

    pub fn with_parent(mut self, parent: Option<TracingCarrier>) -> Self {
        self.parent = parent;
        self
    }
}

/// Span factory contract.
pub trait Tracer: Send + Sync + fmt::Debug {
    fn start_span(&self, options: SpanOptions) -> Box<dyn ActiveSpan>;
}

/// A started span.
pub trait ActiveSpan: Send + Sync {
    fn record_exception(&mut self, exception: &ExceptionEvent);

    /// Write this span's context into a propagation carrier.
    fn inject(&self, carrier: &mut TracingCarrier);

    /// `tracing` span used as parent for work done inside this span.
    fn tracing_span(&self) -> tracing::Span {
        tracing::Span::none()
    }

    /// End the span. Later calls are no-ops.
    fn end(&mut self);
}

/// Default tracer over `tracing` spans.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn start_span(&self, options: SpanOptions) -> Box<dyn ActiveSpan> {
        let span = tracing::info_span!(
            "action",
            otel.name = %options.name,
            otel.kind = options.kind.as_str(),
            otel.status_code = tracing::field::Empty,
            messaging.system = options.mechanism.as_str(),
            messaging.caller = tracing::field::Empty,
        );
        if let Some(caller) = &options.caller {
            span.record("messaging.caller", caller.as_str());
        }
        if let Some(carrier) = &options.parent {
            attach_remote_parent(&span, carrier);
        }
        Box::new(TracingSpan { span: Some(span) })
    }
}

struct TracingSpan {
    span: Option<tracing::Span>,
}

impl ActiveSpan for TracingSpan {
    fn record_exception(&mut self, exception: &ExceptionEvent) {
        if let Some(span) = &self.span {
            span.record("otel.status_code", "ERROR");
            tracing::error!(
                parent: span,
                exception.name = %exception.name,
                exception.code = exception.code,
                exception.message = %exception.message,
                "exception"
            );
        }
    }

    fn inject(&self, carrier: &mut TracingCarrier) {
        if let Some(span) = &self.span {
            inject_context(span, carrier);
        }
    }

    fn tracing_span(&self) -> tracing::Span {
        self.span.clone().unwrap_or_else(tracing::Span::none)
    }

    fn end(&mut self) {
        self.span.take();
    }
}

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry::propagation::{Extractor, Injector};

    use super::TracingCarrier;

    pub(super) struct CarrierInjector<'a>(pub &'a mut TracingCarrier);

    impl Injector for CarrierInjector<'_> {
        fn set(&mut self, key: &str, value: String) {
            self.0.insert(key.to_string(), value);
        }
    }

    pub(super) struct CarrierExtractor<'a>(pub &'a TracingCarrier);

    impl Extractor for CarrierExtractor<'_> {
        fn get(&self, key: &str) -> Option<&str> {
            self.0.get(key).map(String::as_str)
        }

        fn keys(&self) -> Vec<&str> {
            self.0.keys().map(String::as_str).collect()
        }
    }
}

#[cfg(feature = "otel")]
fn attach_remote_parent(span: &tracing::Span, carrier: &TracingCarrier) {
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let parent_cx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&otel::CarrierExtractor(carrier))
    });
    let _ = span.set_parent(parent_cx);
}

#[cfg(not(feature = "otel"))]
fn attach_remote_parent(_span: &tracing::Span, carrier: &TracingCarrier) {
    tracing::trace!(keys = carrier.len(), "remote parent ignored without otel");
}

#[cfg(feature = "otel")]
fn inject_context(span: &tracing::Span, carrier: &mut TracingCarrier) {
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let cx = span.context();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&cx, &mut otel::CarrierInjector(carrier));
    });
}

#[cfg(not(feature = "otel"))]
fn inject_context(_span: &tracing::Span, _carrier: &mut TracingCarrier) {}
