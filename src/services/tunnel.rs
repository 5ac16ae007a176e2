//! WebSocket 隧道
//!
//! 把客户端连接原样转发到上游实例的同名端点，双向并发中继，任一方向结束即拆除两端

use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// 上游连接
pub type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 隧道错误
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid upstream url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Unsupported upstream scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Failed to connect upstream {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
}

/// 会话在上游的日志 WebSocket 地址
///
/// `http`/`https` 分别映射为 `ws`/`wss`
pub fn upstream_url(base: &str, session_id: &str) -> Result<Url, TunnelError> {
    let raw = format!(
        "{}/exam-sessions/{}/kubespray/deploy/logs/ws",
        base.trim_end_matches('/'),
        session_id
    );
    let mut url = Url::parse(&raw).map_err(|source| TunnelError::InvalidUrl {
        url: raw.clone(),
        source,
    })?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(TunnelError::UnsupportedScheme(other.to_string())),
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(TunnelError::UnsupportedScheme(url.scheme().to_string()));
    }

    Ok(url)
}

/// 连接上游
pub async fn connect(base: &str, session_id: &str) -> Result<UpstreamStream, TunnelError> {
    let url = upstream_url(base, session_id)?;
    info!(session_id = %session_id, url = %url, "Connecting upstream WebSocket");

    let (stream, _) = connect_async(url.as_str())
        .await
        .map_err(|source| TunnelError::Connect {
            url: url.to_string(),
            source,
        })?;

    info!(session_id = %session_id, "Upstream WebSocket connected");
    Ok(stream)
}

/// 双向中继直到任一端关闭或收到关闭信号
pub async fn relay(
    client: WebSocket,
    upstream: UpstreamStream,
    session_id: &str,
    shutdown: CancellationToken,
) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(msg) = client_rx.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(session_id = %session_id, error = %e, "Client WebSocket error");
                    break;
                }
            };
            let closing = matches!(msg, AxumMessage::Close(_));
            if let Err(e) = upstream_tx.send(to_upstream(msg)).await {
                warn!(session_id = %session_id, error = %e, "Failed to relay frame upstream");
                break;
            }
            if closing {
                break;
            }
        }
    };

    let upstream_to_client = async {
        while let Some(msg) = upstream_rx.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(session_id = %session_id, error = %e, "Upstream WebSocket error");
                    break;
                }
            };
            let closing = matches!(msg, Message::Close(_));
            let Some(msg) = to_client(msg) else {
                continue;
            };
            if let Err(e) = client_tx.send(msg).await {
                debug!(session_id = %session_id, error = %e, "Failed to relay frame to client");
                break;
            }
            if closing {
                break;
            }
        }
    };

    tokio::select! {
        _ = shutdown.cancelled() => {
            debug!(session_id = %session_id, "Shutting down, closing tunnel");
        }
        _ = client_to_upstream => {
            debug!(session_id = %session_id, "Client side of tunnel finished");
        }
        _ = upstream_to_client => {
            debug!(session_id = %session_id, "Upstream side of tunnel finished");
        }
    }

    // 另一方向随之停止，两端都尝试关闭
    let _ = upstream_tx.close().await;
    let _ = client_tx.close().await;

    info!(session_id = %session_id, "WebSocket tunnel closed");
}

/// 客户端帧 -> 上游帧
pub fn to_upstream(msg: AxumMessage) -> Message {
    match msg {
        AxumMessage::Text(text) => Message::Text(text),
        AxumMessage::Binary(data) => Message::Binary(data),
        AxumMessage::Ping(data) => Message::Ping(data),
        AxumMessage::Pong(data) => Message::Pong(data),
        AxumMessage::Close(frame) => Message::Close(frame.map(|f| CloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason,
        })),
    }
}

/// 上游帧 -> 客户端帧，原始帧不转发
pub fn to_client(msg: Message) -> Option<AxumMessage> {
    match msg {
        Message::Text(text) => Some(AxumMessage::Text(text)),
        Message::Binary(data) => Some(AxumMessage::Binary(data)),
        Message::Ping(data) => Some(AxumMessage::Ping(data)),
        Message::Pong(data) => Some(AxumMessage::Pong(data)),
        Message::Close(frame) => Some(AxumMessage::Close(frame.map(|f| AxumCloseFrame {
            code: u16::from(f.code),
            reason: f.reason,
        }))),
        Message::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_url() {
        let url = upstream_url("ws://10.1.0.5:8080/", "s-1").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://10.1.0.5:8080/exam-sessions/s-1/kubespray/deploy/logs/ws"
        );

        let url = upstream_url("https://kubespray.internal", "s-1").unwrap();
        assert_eq!(url.scheme(), "wss");
    }

    #[test]
    fn test_upstream_url_rejects_bad_input() {
        assert!(matches!(
            upstream_url("not a url", "s-1"),
            Err(TunnelError::InvalidUrl { .. })
        ));
        assert!(matches!(
            upstream_url("ftp://host", "s-1"),
            Err(TunnelError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_close_frame_round_trip_keeps_code() {
        let upstream = to_upstream(AxumMessage::Close(Some(AxumCloseFrame {
            code: 1000,
            reason: "bye".into(),
        })));
        match to_client(upstream) {
            Some(AxumMessage::Close(Some(frame))) => {
                assert_eq!(frame.code, 1000);
                assert_eq!(frame.reason, "bye");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_unreachable_upstream() {
        // 先占用再释放，得到一个大概率无人监听的端口
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect(&format!("ws://{}", addr), "s-1").await;
        assert!(matches!(result, Err(TunnelError::Connect { .. })));
    }
}
