//! TCP RPC server: accept loop and per-connection handler.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::codec::{self, read_frame, write_frame, FRAME_CALL, FRAME_ERROR, FRAME_REPLY};
use super::{CallFrame, ReplyFrame, RpcRouter};
use crate::dispatch::ActionExecutor;
use crate::status::{RpcCode, RpcError};
use crate::types::RpcConfig;

/// Serving state of the RPC server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Unknown,
    Serving,
    NotServing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthDetails {
    pub rpc_server: HealthStatus,
}

/// Health check result: 200 while serving, 503 otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: u16,
    pub details: HealthDetails,
}

/// RPC server dispatching framed calls to the action executor.
#[derive(Debug)]
pub struct RpcServer {
    router: Arc<RpcRouter>,
    executor: Arc<ActionExecutor>,
    config: RpcConfig,
    cancel: CancellationToken,
    status: watch::Sender<HealthStatus>,
}

impl RpcServer {
    pub fn new(router: Arc<RpcRouter>, executor: Arc<ActionExecutor>, config: RpcConfig) -> Self {
        Self {
            router,
            executor,
            config,
            cancel: CancellationToken::new(),
            status: watch::Sender::new(HealthStatus::Unknown),
        }
    }

    pub fn health(&self) -> HealthCheck {
        let status = *self.status.borrow();
        HealthCheck {
            status: if status == HealthStatus::Serving { 200 } else { 503 },
            details: HealthDetails { rpc_server: status },
        }
    }

    /// Observe serving-state changes.
    pub fn subscribe_health(&self) -> watch::Receiver<HealthStatus> {
        self.status.subscribe()
    }

    /// Bind the configured address and serve until shut down.
    ///
    /// Returns immediately when the server is disabled.
    pub async fn serve(&self) -> std::io::Result<()> {
        if !self.config.enabled {
            tracing::info!("rpc server disabled");
            return Ok(());
        }
        let listener = TcpListener::bind(self.config.listen_addr.as_str()).await?;
        self.serve_listener(listener).await
    }

    /// Serve on an already bound listener until shut down.
    pub async fn serve_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        let conn_semaphore = Arc::new(Semaphore::new(self.config.max_connections));
        self.status.send_replace(HealthStatus::Serving);
        tracing::info!(
            "rpc server listening on {} (max_connections={})",
            addr,
            self.config.max_connections,
        );

        let outcome = self.accept_loop(&listener, &conn_semaphore).await;
        self.status.send_replace(HealthStatus::NotServing);
        outcome
    }

    async fn accept_loop(&self, listener: &TcpListener, conn_semaphore: &Arc<Semaphore>) -> std::io::Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("rpc server shutting down");
                    return Ok(());
                }
                accept = listener.accept() => {
                    let (stream, peer) = accept?;

                    // Acquire connection permit (backpressure when at capacity).
                    let permit = match Arc::clone(conn_semaphore).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                "Connection from {} rejected: at max_connections ({})",
                                peer,
                                self.config.max_connections,
                            );
                            drop(stream);
                            continue;
                        }
                    };

                    tracing::debug!("rpc connection from {}", peer);
                    let conn = Connection {
                        router: Arc::clone(&self.router),
                        executor: Arc::clone(&self.executor),
                        cancel: self.cancel.clone(),
                        config: self.config.clone(),
                    };
                    tokio::spawn(async move {
                        if let Err(e) = conn.run(stream, peer, permit).await {
                            tracing::warn!("Connection from {} error: {}", peer, e);
                        }
                    });
                }
            }
        }
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.status.send_replace(HealthStatus::NotServing);
        self.cancel.cancel();
    }
}

struct Connection {
    router: Arc<RpcRouter>,
    executor: Arc<ActionExecutor>,
    cancel: CancellationToken,
    config: RpcConfig,
}

impl Connection {
    /// Read frames, dispatch, write replies.
    async fn run(
        self,
        stream: TcpStream,
        peer: SocketAddr,
        _permit: OwnedSemaphorePermit, // held for connection lifetime
    ) -> std::io::Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let read_timeout = Duration::from_secs(self.config.read_timeout_secs);
        let write_timeout = Duration::from_secs(self.config.write_timeout_secs);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame_result = tokio::time::timeout(read_timeout, read_frame(&mut reader, self.config.max_frame_bytes)) => {
                    let (frame_type, payload) = match frame_result {
                        Err(_elapsed) => {
                            tracing::debug!("Read timeout ({}s), dropping {}", self.config.read_timeout_secs, peer);
                            break;
                        }
                        Ok(result) => match result? {
                            Some(frame) => frame,
                            None => break, // clean EOF
                        },
                    };

                    let reply = if frame_type == FRAME_CALL {
                        match codec::decode::<CallFrame>(&payload) {
                            Ok(call) => self.dispatch(call).await,
                            Err(e) => invalid_argument(e.to_string()),
                        }
                    } else {
                        invalid_argument(format!("Unexpected frame type: 0x{:02X}", frame_type))
                    };

                    let frame_type = if reply.ok { FRAME_REPLY } else { FRAME_ERROR };
                    let encoded = codec::encode(&reply)?;
                    timed_write(&mut writer, frame_type, &encoded, write_timeout).await?;
                }
            }
        }

        Ok(())
    }

    async fn dispatch(&self, call: CallFrame) -> ReplyFrame {
        let result = self
            .router
            .handle(
                &self.executor,
                &call.service,
                &call.method,
                call.metadata,
                call.body,
                call.deadline_ms.map(Duration::from_millis),
            )
            .await;

        match result {
            Ok(body) => ReplyFrame::success(call.id, body),
            Err(err) => {
                tracing::debug!(error = %err, service = %call.service, method = %call.method, "rpc call failed");
                ReplyFrame::failure(call.id, RpcError::from(&err))
            }
        }
    }
}

fn invalid_argument(message: String) -> ReplyFrame {
    ReplyFrame::failure("", RpcError::new(RpcCode::InvalidArgument, message))
}

/// Write a frame with a timeout so slow consumers cannot hold connections.
async fn timed_write<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame_type: u8,
    payload: &[u8],
    timeout: Duration,
) -> std::io::Result<()> {
    tokio::time::timeout(timeout, write_frame(writer, frame_type, payload))
        .await
        .map_err(|_| {
            tracing::warn!("Write timeout ({}s), dropping connection", timeout.as_secs());
            std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout")
        })?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(enabled: bool) -> RpcServer {
        RpcServer::new(
            Arc::new(RpcRouter::default()),
            Arc::new(ActionExecutor::new("gateway")),
            RpcConfig {
                enabled,
                ..RpcConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn disabled_server_does_not_bind() {
        let server = server(false);
        server.serve().await.unwrap();
        assert_eq!(server.health().details.rpc_server, HealthStatus::Unknown);
        assert_eq!(server.health().status, 503);
    }

    #[tokio::test]
    async fn health_follows_lifecycle() {
        let server = Arc::new(server(true));
        assert_eq!(server.health().details.rpc_server, HealthStatus::Unknown);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut health = server.subscribe_health();
        let running = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve_listener(listener).await }
        });

        health
            .wait_for(|status| *status == HealthStatus::Serving)
            .await
            .unwrap();
        assert_eq!(server.health().status, 200);

        server.shutdown();
        running.await.unwrap().unwrap();
        assert_eq!(
            server.health(),
            HealthCheck {
                status: 503,
                details: HealthDetails {
                    rpc_server: HealthStatus::NotServing
                },
            }
        );
    }

    #[test]
    fn health_serializes_like_the_wire_format() {
        let json = serde_json::to_value(server(true).health()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "status": 503, "details": { "rpcServer": "UNKNOWN" } })
        );
    }
}
