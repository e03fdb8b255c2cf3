//! Action dispatch core.
//!
//! Both transport adapters normalize their inbound call into an
//! [`InvocationContext`] and hand it to [`ActionExecutor::execute`], which
//! validates, opens the span, binds the request context, takes the resource
//! lock, runs the handler and records the outcome.
//!
//! ```text
//!   adapter ──► validate ──► span ──► lock ──► handler ──► metrics/span close
//!                  │                    │          │
//!                  └── failure ─────────┴──────────┴──► recorded, propagated
//! ```

mod context;

pub use context::{ActionRef, InvocationContext, NameParts, RequestContext, Transport};

use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

use crate::action::{ActionArguments, ActionDefinition, Headers};
use crate::codec::{self, Document};
use crate::lock::{LockGuard, LockProvider, DEFAULT_LOCK_TTL};
use crate::session::{LogFields, Session};
use crate::telemetry::{
    ActiveSpan, ExceptionEvent, MetricsFacade, MetricsSink, RequestLabels, RequestTimer,
    SpanOptions, Tracer, TracingTracer,
};
use crate::types::{Error, Result};
use crate::validation::{JsonSchemaValidator, ValidationRules, Validator};

/// Executes registered actions for every transport.
#[derive(Clone)]
pub struct ActionExecutor {
    service_name: String,
    validator: Arc<dyn Validator>,
    metrics: Arc<dyn MetricsSink>,
    tracer: Arc<dyn Tracer>,
    lock_provider: Option<Arc<dyn LockProvider>>,
    lock_ttl: Duration,
}

impl ActionExecutor {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            validator: Arc::new(JsonSchemaValidator),
            metrics: Arc::new(MetricsFacade),
            tracer: Arc::new(TracingTracer),
            lock_provider: None,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn with_lock_provider(mut self, provider: Arc<dyn LockProvider>) -> Self {
        self.lock_provider = Some(provider);
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn lock_provider(&self) -> Option<&dyn LockProvider> {
        self.lock_provider.as_deref()
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub fn tracer(&self) -> &Arc<dyn Tracer> {
        &self.tracer
    }

    /// Run one invocation. Single attempt, no retry.
    ///
    /// Returns `Ok(None)` without any side effect when the context names no
    /// action. Bus results are identifier-encoded; RPC results are returned
    /// as produced by the handler.
    pub async fn execute(
        &self,
        ctx: InvocationContext,
        rules: &ValidationRules,
        action: &ActionDefinition,
    ) -> Result<Option<Document>> {
        self.execute_within(ctx, rules, action, None).await
    }

    /// Like [`execute`](Self::execute), bounded by a transport deadline
    /// measured from pipeline entry. An elapsed deadline fails the
    /// invocation with [`Error::DeadlineExceeded`] and is recorded like any
    /// other failure.
    pub async fn execute_within(
        &self,
        ctx: InvocationContext,
        rules: &ValidationRules,
        action: &ActionDefinition,
        deadline: Option<Duration>,
    ) -> Result<Option<Document>> {
        let Some(action_name) = ctx.action.name.clone() else {
            return Ok(None);
        };

        let started = Instant::now();
        let parts = NameParts::parse(&action_name);
        let service = ctx
            .action
            .service
            .clone()
            .or_else(|| parts.service.map(str::to_string))
            .unwrap_or_else(|| self.service_name.clone());
        let route = format!("{service}.{}", ctx.action.raw_name);

        let mut span = self.tracer.start_span(
            SpanOptions::new(
                format!("handle {route}"),
                ctx.transport.span_kind(),
                ctx.transport.mechanism(),
            )
            .with_caller(ctx.caller.clone())
            .with_parent(ctx.tracing.clone()),
        );
        let labels = RequestLabels::new(
            ctx.transport.mechanism(),
            ctx.caller.clone(),
            self.service_name.clone(),
            route.clone(),
        );

        let args = match self.prepare(&ctx, rules, action) {
            Ok(args) => args,
            Err(err) => {
                self.record_failure(span.as_mut(), &labels, started, &err);
                return Err(err);
            }
        };

        let log_fields = LogFields::project(args.session.as_ref(), args.headers.as_ref());
        let request_span = tracing::info_span!(
            parent: &span.tracing_span(),
            "request",
            route = %route,
            trace_id = log_fields.trace_id().unwrap_or_default(),
            session_type = %log_fields.session_type,
            user_identifier = log_fields.user_identifier.as_deref(),
            session_owner_id = log_fields.session_owner_id.as_deref(),
        );
        let request_ctx = Arc::new(RequestContext {
            log_fields,
            session: args.session.clone(),
            headers: args.headers.clone(),
        });

        let invocation = Invocation {
            route: &route,
            parts,
            transport: ctx.transport,
            labels: &labels,
            started,
            deadline,
        };
        request_ctx
            .scope(
                self.run(invocation, action, args, span.as_mut())
                    .instrument(request_span),
            )
            .await
            .map(Some)
    }

    /// Validation, header enrichment and session parsing.
    fn prepare(
        &self,
        ctx: &InvocationContext,
        rules: &ValidationRules,
        action: &ActionDefinition,
    ) -> Result<ActionArguments> {
        let session = match ctx.raw_session() {
            Some(raw) => Some(match &rules.session {
                Some(schema) => {
                    self.validator.validate(raw, schema)?;
                    schema.merge_defaults(raw.clone())
                }
                None => raw.clone(),
            }),
            None => None,
        };

        let raw_params = ctx
            .raw_params()
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let params = match &rules.params {
            Some(schema) => match ctx.transport {
                Transport::Rpc => {
                    self.validator.validate(&ctx.params, schema)?;
                    unwrap_params(schema.merge_defaults(json!({ "params": raw_params })))
                }
                Transport::Bus => {
                    let merged = schema.merge_defaults(json!({ "params": raw_params }));
                    self.validator.validate(&merged, schema)?;
                    unwrap_params(merged)
                }
            },
            None => raw_params,
        };

        let headers = ctx
            .raw_headers()
            .map(|raw| serde_json::from_value::<Headers>(raw.clone()))
            .transpose()
            .map_err(|e| Error::validation(format!("headers: {e}")))?;

        let session = session.as_ref().map(Session::from_value).transpose()?;

        let mut args = ActionArguments {
            params,
            session,
            headers,
            caller: ctx.caller.clone(),
        };
        if args.headers.is_some() {
            if let Some(code) = action.service_code(&args) {
                if let Some(headers) = args.headers.as_mut() {
                    headers.service_code = Some(code);
                }
            }
        }
        Ok(args)
    }

    async fn run(
        &self,
        inv: Invocation<'_>,
        action: &ActionDefinition,
        args: ActionArguments,
        span: &mut dyn ActiveSpan,
    ) -> Result<Document> {
        tracing::info!(
            service = inv.parts.service,
            action = inv.parts.action,
            version = inv.parts.version,
            params = %args.params,
            headers = ?args.headers,
            transport = inv.transport.as_str(),
            "ACT IN: {}",
            inv.route
        );

        let acquired = self.acquire_lock(action, &args);
        let acquired = match inv.deadline {
            Some(deadline) => tokio::time::timeout(
                deadline.saturating_sub(inv.started.elapsed()),
                acquired,
            )
            .await
            .unwrap_or_else(|_| Err(inv.deadline_exceeded(deadline))),
            None => acquired.await,
        };
        let guard = match acquired {
            Ok(guard) => guard,
            Err(err) => {
                self.log_failure(&inv, &args.params, &err);
                self.record_failure(span, inv.labels, inv.started, &err);
                return Err(err);
            }
        };

        let params = args.params.clone();
        let handled = AssertUnwindSafe(action.handler().handle(args)).catch_unwind();
        let outcome = match inv.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_sub(inv.started.elapsed());
                tokio::time::timeout(remaining, handled)
                    .await
                    .unwrap_or_else(|_| Ok(Err(inv.deadline_exceeded(deadline))))
            }
            None => handled.await,
        }
        .unwrap_or_else(|panic| Err(Error::internal(panic_message(&*panic))));

        let result = match outcome {
            Ok(doc) => {
                let doc = match inv.transport {
                    Transport::Bus => codec::encode(&doc),
                    Transport::Rpc => doc,
                };
                tracing::info!(result = %doc.to_json(), "ACT IN RESULT: {}", inv.route);
                self.metrics
                    .observe(RequestTimer::Inbound, &inv.labels.succeeded(), inv.started.elapsed());
                span.end();
                Ok(doc)
            }
            Err(err) => {
                self.log_failure(&inv, &params, &err);
                self.record_failure(span, inv.labels, inv.started, &err);
                Err(err)
            }
        };

        if let Some(guard) = guard {
            if let Err(err) = guard.release().await {
                tracing::warn!(error = %err, "lock release failed");
            }
        }

        result
    }

    async fn acquire_lock(
        &self,
        action: &ActionDefinition,
        args: &ActionArguments,
    ) -> Result<Option<LockGuard>> {
        let Some(resource) = action.lock_resource(args).filter(|r| !r.is_empty()) else {
            return Ok(None);
        };
        let provider = self.lock_provider.as_ref().ok_or_else(|| {
            Error::registration(format!(
                "action {} derives a lock resource but no lock provider is configured",
                action.route_key()
            ))
        })?;

        let resource = format!("{}.{}", action.name(), resource);
        let handle = provider.lock(&resource, self.lock_ttl).await?;
        Ok(Some(LockGuard::new(handle)))
    }

    fn log_failure(&self, inv: &Invocation<'_>, params: &Value, err: &Error) {
        tracing::error!(
            error = %err,
            service = inv.parts.service,
            action = inv.parts.action,
            version = inv.parts.version,
            params = %params,
            "ACT IN FAILED: {}",
            inv.route
        );
    }

    fn record_failure(
        &self,
        span: &mut dyn ActiveSpan,
        labels: &RequestLabels,
        started: Instant,
        err: &Error,
    ) {
        self.metrics
            .observe(RequestTimer::Inbound, &labels.failed(err), started.elapsed());
        span.record_exception(&ExceptionEvent::from(err));
        span.end();
    }
}

impl fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("service_name", &self.service_name)
            .field("validator", &self.validator)
            .field("metrics", &self.metrics)
            .field("tracer", &self.tracer)
            .field("lock_provider", &self.lock_provider.is_some())
            .field("lock_ttl", &self.lock_ttl)
            .finish()
    }
}

struct Invocation<'a> {
    route: &'a str,
    parts: NameParts<'a>,
    transport: Transport,
    labels: &'a RequestLabels,
    started: Instant,
    deadline: Option<Duration>,
}

impl Invocation<'_> {
    fn deadline_exceeded(&self, deadline: Duration) -> Error {
        Error::deadline_exceeded(format!("{} exceeded {}ms", self.route, deadline.as_millis()))
    }
}

fn unwrap_params(mut envelope: Value) -> Value {
    envelope
        .get_mut("params")
        .map(Value::take)
        .unwrap_or_else(|| Value::Object(Map::new()))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests;
