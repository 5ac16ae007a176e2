//! WebSocket 日志通道
//!
//! WS /exam-sessions/:id/kubespray/deploy/logs/ws
//!
//! 本地模式下连接注册到会话房间并接收事件推送，同时处理 ping / get_status / command；
//! 配置了上游地址时作为隧道，把连接转发到上游实例。

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::env::constants::WS_OUTBOUND_CAPACITY;
use crate::domain::ws::{ClientMessage, ClientMessageError, WsEnvelope};
use crate::services::tunnel;
use crate::state::AppState;

/// 创建 WebSocket 路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/exam-sessions/:id/kubespray/deploy/logs/ws", get(ws_handler))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        match state.config.ws_upstream_url.clone() {
            Some(upstream) => {
                run_tunnel(socket, &upstream, &session_id, state.shutdown.clone()).await
            }
            None => run_hub(socket, state, session_id).await,
        }
    })
}

/// 本地模式
async fn run_hub(socket: WebSocket, state: Arc<AppState>, session_id: String) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsEnvelope>(WS_OUTBOUND_CAPACITY);

    // connected 先入队，保证是第一条消息
    let _ = tx.try_send(WsEnvelope::connected(&session_id));
    let connection_id = state.ws_registry.register(&session_id, tx.clone()).await;

    let writer_session = session_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    warn!(session_id = %writer_session, error = %e, "Failed to encode WebSocket message, dropped");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let msg = tokio::select! {
            _ = state.shutdown.cancelled() => {
                debug!(session_id = %session_id, "Shutting down, closing WebSocket");
                break;
            }
            msg = stream.next() => msg,
        };
        let Some(msg) = msg else {
            break;
        };
        match msg {
            Ok(Message::Text(text)) => {
                let reply = handle_client_message(&state, &session_id, &text).await;
                if tx.send(reply).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                debug!(session_id = %session_id, "Ignoring binary WebSocket frame");
            }
            // ping/pong 由协议层自动处理
            Ok(_) => {}
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    state.ws_registry.unregister(&session_id, &connection_id).await;
    drop(tx);
    let _ = writer.await;

    info!(session_id = %session_id, connection_id = %connection_id, "WebSocket connection closed");
}

/// 处理入站控制消息，返回应答
async fn handle_client_message(state: &AppState, session_id: &str, text: &str) -> WsEnvelope {
    match ClientMessage::parse(text) {
        Ok(ClientMessage::Ping) => WsEnvelope::pong(session_id),
        Ok(ClientMessage::GetStatus) => match state.status_store.get(session_id).await {
            Some(status) => WsEnvelope::status(&status).unwrap_or_else(|e| {
                warn!(session_id = %session_id, error = %e, "Failed to encode status");
                WsEnvelope::error(session_id, "Failed to encode deployment status")
            }),
            None => WsEnvelope::error(session_id, "No deployment status found"),
        },
        Ok(ClientMessage::Command(command)) => {
            info!(session_id = %session_id, command = %command, "WebSocket command received");
            WsEnvelope::command_received(session_id, command)
        }
        Err(ClientMessageError::Malformed) => {
            warn!(session_id = %session_id, "Malformed WebSocket message");
            WsEnvelope::error(session_id, "Invalid JSON message")
        }
        Err(ClientMessageError::UnknownType(kind)) => {
            warn!(session_id = %session_id, kind = %kind, "Unknown WebSocket message type");
            WsEnvelope::error(session_id, format!("Unknown message type: {}", kind))
        }
    }
}

/// 隧道模式
async fn run_tunnel(
    mut socket: WebSocket,
    upstream: &str,
    session_id: &str,
    shutdown: CancellationToken,
) {
    match tunnel::connect(upstream, session_id).await {
        Ok(upstream) => tunnel::relay(socket, upstream, session_id, shutdown).await,
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Upstream WebSocket unavailable");
            let envelope = WsEnvelope::error(session_id, format!("Upstream unavailable: {}", e));
            if let Ok(text) = serde_json::to_string(&envelope) {
                let _ = socket.send(Message::Text(text)).await;
            }
            let _ = socket.send(Message::Close(None)).await;
        }
    }
}
