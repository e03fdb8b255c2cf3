//! Outbound RPC calls.

use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use super::codec::{self, read_frame, write_frame, FRAME_CALL};
use super::metadata::{self, Metadata};
use super::{CallFrame, ReplyFrame};
use crate::action::ActionVersion;
use crate::dispatch::RequestContext;
use crate::telemetry::{
    ExceptionEvent, Mechanism, MetricsFacade, MetricsSink, RequestLabels, RequestTimer, SpanKind,
    SpanOptions, Tracer, TracingCarrier, TracingTracer,
};
use crate::types::{Error, RequestId, Result};

/// Metadata for a call carrying a session and an explicit action version.
pub fn call_metadata(session: Option<&Value>, version: Option<&ActionVersion>) -> Metadata {
    let mut md = Metadata::new();
    if let Some(session) = session {
        md.insert(metadata::SESSION.to_string(), metadata::encode_session(session));
    }
    if let Some(version) = version {
        md.insert(metadata::ACTION_VERSION.to_string(), version.to_string());
    }
    md
}

/// Client for one remote RPC endpoint. Each call uses its own connection.
#[derive(Debug, Clone)]
pub struct RpcClient {
    addr: String,
    service_name: String,
    metrics: Arc<dyn MetricsSink>,
    tracer: Arc<dyn Tracer>,
    max_frame_bytes: u32,
}

impl RpcClient {
    pub fn new(addr: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            service_name: service_name.into(),
            metrics: Arc::new(MetricsFacade),
            tracer: Arc::new(TracingTracer),
            max_frame_bytes: 5 * 1024 * 1024,
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

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: u32) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Perform one call. The deadline bounds the whole exchange and is also
    /// sent to the server.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        body: Value,
        metadata: Metadata,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        let started = Instant::now();
        let route = format!("{service}.{method}");
        let mut span = self.tracer.start_span(
            SpanOptions::new(format!("send {service}/{method}"), SpanKind::Client, Mechanism::Rpc)
                .with_caller(Some(self.service_name.clone())),
        );
        let labels = RequestLabels::new(
            Mechanism::Rpc,
            Some(self.service_name.clone()),
            service,
            route.clone(),
        );

        let mut carrier = TracingCarrier::new();
        span.inject(&mut carrier);
        let metadata = outbound_metadata(metadata, &carrier)?;

        let frame = CallFrame {
            id: RequestId::new().to_string(),
            service: service.to_string(),
            method: method.to_string(),
            metadata,
            body,
            deadline_ms: deadline.map(|d| d.as_millis().try_into().unwrap_or(u64::MAX)),
        };

        tracing::debug!(route = %route, id = %frame.id, "rpc call");
        let exchange = self.exchange(frame);
        let outcome = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, exchange)
                .await
                .unwrap_or_else(|_| {
                    Err(Error::deadline_exceeded(format!(
                        "{route} exceeded {}ms",
                        deadline.as_millis()
                    )))
                }),
            None => exchange.await,
        };

        let elapsed = started.elapsed();
        match &outcome {
            Ok(_) => {
                self.metrics
                    .observe(RequestTimer::Outbound, &labels.succeeded(), elapsed);
            }
            Err(err) => {
                tracing::warn!(error = %err, route = %route, "rpc call failed");
                self.metrics
                    .observe(RequestTimer::Outbound, &labels.failed(err), elapsed);
                span.record_exception(&ExceptionEvent::from(err));
            }
        }
        span.end();
        outcome
    }

    async fn exchange(&self, frame: CallFrame) -> Result<Value> {
        let mut stream = TcpStream::connect(self.addr.as_str()).await?;
        let payload = codec::encode(&frame)?;
        write_frame(&mut stream, FRAME_CALL, &payload).await?;

        let (_, payload) = read_frame(&mut stream, self.max_frame_bytes)
            .await?
            .ok_or_else(|| Error::internal("connection closed before reply"))?;
        let reply: ReplyFrame = codec::decode(&payload)?;

        match (reply.ok, reply.error) {
            (true, _) => Ok(reply.body.unwrap_or(Value::Null)),
            (false, Some(error)) => Err(Error::Rpc(error)),
            (false, None) => Err(Error::internal("error reply without error details")),
        }
    }
}

/// Merge the current request context and tracing carrier into call metadata.
/// Explicit entries win.
fn outbound_metadata(explicit: Metadata, carrier: &TracingCarrier) -> Result<Metadata> {
    let mut md = Metadata::new();
    if let Some(ctx) = RequestContext::current() {
        md.extend(
            ctx.log_fields
                .to_pairs()
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v)),
        );
    }
    if !carrier.is_empty() {
        md.insert(metadata::TRACING.to_string(), serde_json::to_string(carrier)?);
    }
    md.extend(metadata::normalize(explicit));
    Ok(md)
}
