//! Action declarations.
//!
//! An [`ActionDefinition`] is declared once at startup: a name, an optional
//! version, the session type it serves, optional parameter rules, optional
//! lock-resource and service-code derivations, and the handler itself.
//! [`registry::register`] turns a list of definitions into an immutable
//! route table.

pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::codec::Document;
use crate::session::{Session, SessionType};
use crate::types::Result;

pub use registry::{register, Route, RouteTable};

/// Action version label (`v1`, `v2`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionVersion(String);

impl ActionVersion {
    pub const DEFAULT: &'static str = "v1";

    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// The implicit version of actions that declare none.
    pub fn v1() -> Self {
        Self(Self::DEFAULT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_default(&self) -> bool {
        self.0 == Self::DEFAULT
    }

    fn number(&self) -> Option<u64> {
        self.0
            .strip_prefix(['v', 'V'])
            .and_then(|n| n.parse().ok())
    }
}

impl Default for ActionVersion {
    fn default() -> Self {
        Self::v1()
    }
}

impl Ord for ActionVersion {
    /// `v2 < v10`; non-numeric labels sort after numeric ones, lexically.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.number(), other.number()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for ActionVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ActionVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionVersion {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Request headers travelling with an action call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Headers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_version: Option<ActionVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_code: Option<String>,
    /// Serialized tracing carrier (JSON object of propagation keys).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracing: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Headers {
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Parse the `tracing` header into a propagation carrier.
    pub fn tracing_carrier(&self) -> Option<crate::telemetry::TracingCarrier> {
        self.tracing
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Arguments handed to an action handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionArguments {
    /// Validated parameters with schema defaults applied.
    pub params: Value,
    pub session: Option<Session>,
    pub headers: Option<Headers>,
    /// Calling service, when the transport knows it.
    pub caller: Option<String>,
}

impl ActionArguments {
    /// Deserialize the parameters into a typed struct.
    pub fn params_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.params.clone())
            .map_err(|e| crate::Error::validation(format!("params: {e}")))
    }
}

/// Business logic behind an action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, args: ActionArguments) -> Result<Document>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(ActionArguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Document>> + Send + 'static,
{
    async fn handle(&self, args: ActionArguments) -> Result<Document> {
        (self.0)(args).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(ActionArguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Document>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Derives a string (lock resource, public service code) from the call.
pub type ArgumentsFn = Arc<dyn Fn(&ActionArguments) -> String + Send + Sync>;

/// Static declaration of one action.
#[derive(Clone)]
pub struct ActionDefinition {
    name: String,
    version: Option<ActionVersion>,
    session_type: SessionType,
    params_rules: Option<Value>,
    lock_resource: Option<ArgumentsFn>,
    service_code: Option<ArgumentsFn>,
    handler: Arc<dyn ActionHandler>,
}

impl ActionDefinition {
    pub fn new(
        name: impl Into<String>,
        session_type: SessionType,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            version: None,
            session_type,
            params_rules: None,
            lock_resource: None,
            service_code: None,
            handler,
        }
    }

    pub fn with_version(mut self, version: impl Into<ActionVersion>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// JSON Schema of the `params` object.
    pub fn with_params_rules(mut self, rules: Value) -> Self {
        self.params_rules = Some(rules);
        self
    }

    /// Serialize calls per derived resource; requires a lock provider.
    pub fn with_lock_resource<F>(mut self, f: F) -> Self
    where
        F: Fn(&ActionArguments) -> String + Send + Sync + 'static,
    {
        self.lock_resource = Some(Arc::new(f));
        self
    }

    pub fn with_service_code<F>(mut self, f: F) -> Self
    where
        F: Fn(&ActionArguments) -> String + Send + Sync + 'static,
    {
        self.service_code = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared version, or `v1`.
    pub fn version(&self) -> ActionVersion {
        self.version.clone().unwrap_or_default()
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn params_rules(&self) -> Option<&Value> {
        self.params_rules.as_ref()
    }

    pub fn needs_lock(&self) -> bool {
        self.lock_resource.is_some()
    }

    pub fn lock_resource(&self, args: &ActionArguments) -> Option<String> {
        self.lock_resource.as_ref().map(|f| f(args))
    }

    pub fn service_code(&self, args: &ActionArguments) -> Option<String> {
        self.service_code.as_ref().map(|f| f(args))
    }

    pub fn handler(&self) -> &Arc<dyn ActionHandler> {
        &self.handler
    }

    /// `name`, or `name@version` for non-default versions.
    pub fn route_key(&self) -> String {
        route_key(&self.name, self.version.as_ref())
    }
}

impl fmt::Debug for ActionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDefinition")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("session_type", &self.session_type)
            .field("params_rules", &self.params_rules)
            .field("lock_resource", &self.lock_resource.is_some())
            .field("service_code", &self.service_code.is_some())
            .finish_non_exhaustive()
    }
}

/// Route key for a name and optional version.
pub fn route_key(name: &str, version: Option<&ActionVersion>) -> String {
    match version {
        Some(v) if !v.is_default() => format!("{name}@{v}"),
        _ => name.to_string(),
    }
}
