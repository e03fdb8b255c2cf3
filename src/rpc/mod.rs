//! RPC adapter: framed request/response calls over TCP.
//!
//! Each call names a declared service and method. The method resolves to a
//! registered action by version; the body is the raw params and the metadata
//! carries headers and the base64 JSON session.
//!
//! Request:  `{ id, service, method, metadata, body, deadline_ms? }`
//! Reply:    `{ id, ok: true, body }` or `{ id, ok: false, error: { message, code, metadata } }`

pub mod client;
pub mod codec;
pub mod descriptor;
pub mod metadata;
pub mod server;
pub mod service;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::RpcError;

pub use client::{call_metadata, RpcClient};
pub use descriptor::{DescriptorSet, MethodDescriptor, ServiceDescriptor};
pub use metadata::Metadata;
pub use server::{HealthCheck, HealthStatus, RpcServer};
pub use service::{RpcMethod, RpcRouter};

/// One call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFrame {
    pub id: String,
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

/// Reply to one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl ReplyFrame {
    pub fn success(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            body: Some(body),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: RpcError) -> Self {
        Self {
            id: id.into(),
            ok: false,
            body: None,
            error: Some(error),
        }
    }
}
