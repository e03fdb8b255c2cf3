//! Method → versioned action resolution for declared services.

use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use super::descriptor::DescriptorSet;
use super::metadata::{self, Metadata};
use crate::action::{ActionVersion, Route, RouteTable};
use crate::dispatch::{ActionExecutor, ActionRef, InvocationContext, Transport};
use crate::types::{Error, Result};

/// A served method: every registered version of its action.
#[derive(Debug, Clone)]
pub struct RpcMethod {
    service: String,
    action: String,
    versions: BTreeMap<ActionVersion, Route>,
}

impl RpcMethod {
    pub fn action_name(&self) -> &str {
        &self.action
    }

    pub fn versions(&self) -> impl Iterator<Item = &ActionVersion> {
        self.versions.keys()
    }

    /// The single version, or the highest when several exist.
    pub fn default_version(&self) -> ActionVersion {
        self.versions
            .keys()
            .next_back()
            .cloned()
            .unwrap_or_default()
    }

    pub fn resolve(&self, version: &ActionVersion) -> Result<&Route> {
        self.versions
            .get(version)
            .ok_or_else(|| Error::not_implemented(version.as_str()))
    }
}

/// Methods of every served service, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct RpcRouter {
    methods: HashMap<String, HashMap<String, RpcMethod>>,
}

impl RpcRouter {
    /// Bind each declared service's methods to the registered actions.
    ///
    /// Fails when a service is not declared or a method has no action.
    pub fn build(descriptors: &DescriptorSet, services: &[String], routes: &RouteTable) -> Result<Self> {
        let mut methods = HashMap::new();
        for service_name in services {
            let descriptor = descriptors.resolve(service_name)?;
            let mut service_methods = HashMap::new();
            for method in &descriptor.methods {
                let action = method.action_name();
                let versions = routes.versions_of(action);
                if versions.is_empty() {
                    return Err(Error::registration(format!(
                        "Unable to find any action for {action}"
                    )));
                }
                service_methods.insert(
                    method.name.clone(),
                    RpcMethod {
                        service: descriptor.full_name.clone(),
                        action: action.to_string(),
                        versions,
                    },
                );
            }
            tracing::info!(
                service = %descriptor.full_name,
                methods = service_methods.len(),
                "rpc service bound"
            );
            methods.insert(descriptor.full_name.clone(), service_methods);
        }
        Ok(Self { methods })
    }

    pub fn method(&self, service: &str, method: &str) -> Result<&RpcMethod> {
        self.methods
            .get(service)
            .and_then(|methods| methods.get(method))
            .ok_or_else(|| Error::UnknownMethod(format!("{service}/{method}")))
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Resolve the action for one call and run it, bounded by the caller's
    /// deadline when one was sent.
    pub async fn handle(
        &self,
        executor: &ActionExecutor,
        service: &str,
        method: &str,
        metadata: Metadata,
        body: Value,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        let rpc_method = self.method(service, method)?;
        let metadata = metadata::normalize(metadata);

        let headers = metadata::extract_headers(&metadata, rpc_method.default_version());
        let version = headers.action_version.clone().unwrap_or_default();
        let route = rpc_method.resolve(&version)?;
        let session = metadata::extract_session(&metadata)?;
        let tracing = headers.tracing_carrier();

        let mut params = json!({ "params": body, "headers": headers });
        if let Some(session) = session {
            params["session"] = session;
        }
        let ctx = InvocationContext {
            action: ActionRef {
                name: Some(route.action.name().to_string()),
                raw_name: route.action.name().to_string(),
                service: Some(rpc_method.service.clone()),
            },
            caller: None,
            params,
            transport: Transport::Rpc,
            tracing,
        };

        let result = executor
            .execute_within(ctx, &route.rules, &route.action, deadline)
            .await?;
        Ok(result.map(|doc| doc.to_json()).unwrap_or(Value::Null))
    }
}
