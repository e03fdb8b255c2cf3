//! Serves registered actions over the message bus.

use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{BusCall, BusEnvelope, BusReply, CallReceiver, MessageBus};
use crate::action::{Route, RouteTable};
use crate::dispatch::{ActionExecutor, ActionRef, InvocationContext, Transport};
use crate::types::{Error, Result};

/// Binds every route of a [`RouteTable`] to `<service>.<routeKey>` on the bus.
#[derive(Debug)]
pub struct BusAdapter {
    bus: Arc<MessageBus>,
    executor: Arc<ActionExecutor>,
    routes: Arc<RouteTable>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BusAdapter {
    pub fn new(bus: Arc<MessageBus>, executor: Arc<ActionExecutor>, routes: Arc<RouteTable>) -> Self {
        Self {
            bus,
            executor,
            routes,
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Bus name of a route served by this adapter.
    pub fn bus_name(&self, route_key: &str) -> String {
        format!("{}.{}", self.executor.service_name(), route_key)
    }

    /// Register every route and start one receive loop per route.
    pub async fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock().await;
        for (key, route) in self.routes.iter() {
            let name = self.bus_name(key);
            let rx = self.bus.register_action(name.clone()).await?;
            let worker = tokio::spawn(receive_loop(
                rx,
                route.clone(),
                Arc::clone(&self.executor),
                self.cancel.clone(),
            ));
            workers.push(worker);
            tracing::debug!(action = %name, "bus route bound");
        }
        tracing::info!(
            service = self.executor.service_name(),
            routes = self.routes.len(),
            "bus adapter started"
        );
        Ok(())
    }

    /// Unregister all routes and stop the receive loops.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        for key in self.routes.keys() {
            self.bus.unregister_action(&self.bus_name(key)).await?;
        }
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!("bus worker ended abnormally: {}", e);
            }
        }
        tracing::info!(service = self.executor.service_name(), "bus adapter stopped");
        Ok(())
    }
}

async fn receive_loop(
    mut rx: CallReceiver,
    route: Route,
    executor: Arc<ActionExecutor>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => {
                let Some((call, reply_tx)) = next else { break };
                let route = route.clone();
                let executor = Arc::clone(&executor);
                tokio::spawn(serve_call(call, reply_tx, route, executor));
            }
        }
    }
}

async fn serve_call(
    call: BusCall,
    reply_tx: oneshot::Sender<BusReply>,
    route: Route,
    executor: Arc<ActionExecutor>,
) {
    let reply = match handle(&executor, &route, &call).await {
        Ok(bytes) => BusReply::ok(bytes),
        Err(err) => BusReply::failed(err.to_api_error()),
    };
    if reply_tx.send(reply).is_err() {
        tracing::debug!(action = %call.action, "caller went away before reply");
    }
}

/// Decode the payload, run the action and serialize its result.
pub(crate) async fn handle(
    executor: &ActionExecutor,
    route: &Route,
    call: &BusCall,
) -> Result<Vec<u8>> {
    let envelope: BusEnvelope = serde_json::from_slice(&call.payload)
        .map_err(|e| Error::validation(format!("malformed bus payload: {e}")))?;
    let ctx = invocation_context(envelope);

    let result = executor.execute(ctx, &route.rules, &route.action).await?;
    Ok(serde_json::to_vec(&result)?)
}

pub(crate) fn invocation_context(envelope: BusEnvelope) -> InvocationContext {
    InvocationContext {
        action: ActionRef {
            name: envelope.action.name,
            raw_name: envelope.action.raw_name,
            service: envelope.action.service.name,
        },
        caller: envelope.caller,
        params: envelope.params,
        transport: Transport::Bus,
        tracing: envelope.meta.and_then(|meta| meta.tracing),
    }
}
