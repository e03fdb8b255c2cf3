//! In-process message bus for action calls.
//!
//! Request/response only: a service registers one handler channel per
//! action name (`<service>.<routeKey>`), callers send a [`BusCall`] and wait
//! for the [`BusReply`] with a timeout. Payloads are JSON-encoded
//! [`BusEnvelope`]s.
//!
//! - [`adapter::BusAdapter`] serves registered actions through the dispatch core.
//! - [`client::BusClient`] calls actions of other services.

pub mod adapter;
pub mod client;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{timeout, Duration};

use crate::telemetry::TracingCarrier;
use crate::types::{ApiError, BusConfig, Error, Result};

pub use adapter::BusAdapter;
pub use client::{BusClient, CallAction, CallArguments};

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BusService {
    #[serde(default)]
    pub name: Option<String>,
}

/// Addressed action inside a bus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BusAction {
    /// Full name, `<service>.<routeKey>`.
    #[serde(default)]
    pub name: Option<String>,
    pub raw_name: String,
    #[serde(default)]
    pub service: BusService,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BusMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracing: Option<TracingCarrier>,
}

/// Payload of an action call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub action: BusAction,
    #[serde(default)]
    pub caller: Option<String>,
    /// Argument envelope `{ params, session?, headers? }`.
    pub params: Value,
    #[serde(default)]
    pub meta: Option<BusMeta>,
}

/// Call message for the request/response pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusCall {
    pub action: String,
    pub payload: Vec<u8>, // JSON-encoded BusEnvelope
    pub timeout_ms: u64,
    pub source: String,
}

/// Response to a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusReply {
    pub success: bool,
    pub result: Vec<u8>, // JSON-encoded
    pub error: Option<ApiError>,
}

impl BusReply {
    pub fn ok(result: Vec<u8>) -> Self {
        Self {
            success: true,
            result,
            error: None,
        }
    }

    pub fn failed(error: ApiError) -> Self {
        Self {
            success: false,
            result: Vec::new(),
            error: Some(error),
        }
    }
}

type CallSender = mpsc::UnboundedSender<(BusCall, oneshot::Sender<BusReply>)>;
pub type CallReceiver = mpsc::UnboundedReceiver<(BusCall, oneshot::Sender<BusReply>)>;

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub calls_executed: u64,
    pub calls_failed: u64,
    pub registered_actions: usize,
}

// =============================================================================
// MessageBus - In-Memory Request/Response Bus
// =============================================================================

/// In-memory bus routing action calls to registered handler channels.
#[derive(Debug)]
pub struct MessageBus {
    /// Action handlers: action name -> handler channel
    handlers: Arc<RwLock<HashMap<String, CallSender>>>,

    config: BusConfig,

    /// Statistics
    stats: Arc<RwLock<BusStats>>,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            config,
            stats: Arc::new(RwLock::new(BusStats::default())),
        }
    }

    /// Timeout applied to a call: the default when the caller gives none,
    /// capped at the configured maximum.
    pub fn effective_timeout(&self, requested_ms: u64) -> Duration {
        let ms = if requested_ms == 0 {
            self.config.default_timeout_ms
        } else {
            requested_ms
        };
        Duration::from_millis(ms.min(self.config.max_timeout_ms))
    }

    /// Execute a call and wait for the reply (with timeout).
    pub async fn call(&self, call: BusCall) -> Result<BusReply> {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&call.action).cloned().ok_or_else(|| {
                Error::not_found(format!("No handler registered for action: {}", call.action))
            })?
        };

        // Create oneshot channel for response
        let (response_tx, response_rx) = oneshot::channel();

        let action = call.action.clone();
        let call_timeout = self.effective_timeout(call.timeout_ms);
        handler.send((call, response_tx)).map_err(|_| {
            Error::internal(format!("Failed to send call to handler: {action}"))
        })?;

        let response = timeout(call_timeout, response_rx)
            .await
            .map_err(|_| {
                Error::deadline_exceeded(format!(
                    "Call timeout after {}ms: {action}",
                    call_timeout.as_millis()
                ))
            })?
            .map_err(|_| Error::internal(format!("Call response channel closed: {action}")))?;

        let mut stats = self.stats.write().await;
        stats.calls_executed += 1;
        if !response.success {
            stats.calls_failed += 1;
        }

        tracing::debug!("Executed call action={}", action);

        Ok(response)
    }

    /// Register a handler channel for an action.
    ///
    /// Handler must send the reply via the oneshot channel provided with each call.
    pub async fn register_action(&self, action: String) -> Result<CallReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut handlers = self.handlers.write().await;

        if handlers.contains_key(&action) {
            return Err(Error::registration(format!(
                "Action handler already registered: {action}"
            )));
        }

        handlers.insert(action.clone(), tx);

        let mut stats = self.stats.write().await;
        stats.registered_actions = handlers.len();

        tracing::debug!("Registered action handler: {}", action);

        Ok(rx)
    }

    /// Unregister an action handler.
    pub async fn unregister_action(&self, action: &str) -> Result<()> {
        let mut handlers = self.handlers.write().await;
        handlers.remove(action);

        let mut stats = self.stats.write().await;
        stats.registered_actions = handlers.len();

        tracing::debug!("Unregistered action handler: {}", action);

        Ok(())
    }

    /// Get current bus statistics.
    pub async fn get_stats(&self) -> BusStats {
        self.stats.read().await.clone()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
