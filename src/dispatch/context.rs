//! Per-invocation inputs and the task-scoped request context.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::action::Headers;
use crate::session::{LogFields, Session};
use crate::telemetry::{Mechanism, SpanKind, TracingCarrier};

/// Transport an invocation arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Bus,
    Rpc,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        self.mechanism().as_str()
    }

    pub fn mechanism(self) -> Mechanism {
        match self {
            Transport::Bus => Mechanism::Bus,
            Transport::Rpc => Mechanism::Rpc,
        }
    }

    pub fn span_kind(self) -> SpanKind {
        match self {
            Transport::Bus => SpanKind::Consumer,
            Transport::Rpc => SpanKind::Server,
        }
    }
}

/// Addressed action as seen by the transport.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActionRef {
    /// Full name (`service.action` or `service.action@version`). Absent for
    /// transport-level pings that carry no action.
    pub name: Option<String>,
    pub raw_name: String,
    pub service: Option<String>,
}

/// Inbound call normalized by an adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationContext {
    pub action: ActionRef,
    pub caller: Option<String>,
    /// Argument envelope `{ params, session?, headers? }` as received.
    pub params: Value,
    pub transport: Transport,
    pub tracing: Option<TracingCarrier>,
}

impl InvocationContext {
    fn envelope_field(&self, key: &str) -> Option<&Value> {
        self.params.get(key).filter(|v| !v.is_null())
    }

    pub fn raw_params(&self) -> Option<&Value> {
        self.envelope_field("params")
    }

    pub fn raw_session(&self) -> Option<&Value> {
        self.envelope_field("session")
    }

    pub fn raw_headers(&self) -> Option<&Value> {
        self.envelope_field("headers")
    }
}

/// Split of `service.action@version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameParts<'a> {
    pub service: Option<&'a str>,
    pub action: &'a str,
    pub version: Option<&'a str>,
}

impl<'a> NameParts<'a> {
    pub fn parse(name: &'a str) -> Self {
        let (service, rest) = match name.split_once('.') {
            Some((service, rest)) => (Some(service), rest),
            None => (None, name),
        };
        let (action, version) = match rest.split_once('@') {
            Some((action, version)) => (action, Some(version)),
            None => (rest, None),
        };
        Self {
            service,
            action,
            version,
        }
    }
}

/// Context bound to one invocation for everything it awaits.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub log_fields: LogFields,
    pub session: Option<Session>,
    pub headers: Option<Headers>,
}

tokio::task_local! {
    static REQUEST_CONTEXT: Arc<RequestContext>;
}

impl RequestContext {
    /// Context of the invocation running on this task, if any.
    pub fn current() -> Option<Arc<RequestContext>> {
        REQUEST_CONTEXT.try_with(Arc::clone).ok()
    }

    /// Run `fut` with this context bound.
    pub async fn scope<F: Future>(self: Arc<Self>, fut: F) -> F::Output {
        REQUEST_CONTEXT.scope(self, fut).await
    }
}
