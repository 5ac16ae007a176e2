//! 部署管理 API
//!
//! 包含 /exam-sessions/:id/kubespray/deploy, /deploy/status, /deploy/logs/stream 端点

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::header,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::config::env::constants::SSE_KEEPALIVE_SECS;
use crate::domain::deploy::{DeploymentRequest, DeploymentStatus, DEFAULT_PLAYBOOK};
use crate::error::{ApiError, ApiResult};
use crate::services;
use crate::state::AppState;

/// 部署请求体（可省略）
#[derive(Debug, Deserialize)]
pub struct DeployBody {
    #[serde(default = "default_playbook")]
    pub playbook: String,
}

fn default_playbook() -> String {
    DEFAULT_PLAYBOOK.to_string()
}

impl Default for DeployBody {
    fn default() -> Self {
        Self {
            playbook: default_playbook(),
        }
    }
}

/// 部署响应
#[derive(Debug, Serialize)]
pub struct DeployResponse {
    pub session_id: String,
    pub status: String,
    pub playbook: String,
    pub log_stream_url: String,
    pub started_at: DateTime<Utc>,
}

/// 创建部署管理路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/exam-sessions/:id/kubespray/deploy", post(start_deploy))
        .route(
            "/exam-sessions/:id/kubespray/deploy/status",
            get(get_deploy_status),
        )
        .route(
            "/exam-sessions/:id/kubespray/deploy/logs/stream",
            get(stream_logs),
        )
}

/// 解析可选的请求体，空请求体使用默认 playbook
fn parse_body(body: &Bytes) -> ApiResult<DeployBody> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(DeployBody::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request(format!("Invalid deploy request body: {}", e)))
}

/// 启动部署
///
/// POST /exam-sessions/:id/kubespray/deploy
///
/// 立即返回，部署结果通过状态查询或日志流获得
async fn start_deploy(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let body = parse_body(&body)?;

    // 检查 inventory 是否已生成
    if !state.generator.inventory_exists(&session_id).await {
        return Err(ApiError::not_found(format!(
            "Inventory for session '{}'",
            session_id
        )));
    }

    // 获取全局部署名额
    let permit = state.admission.try_acquire(&session_id).map_err(|denied| {
        warn!(
            session_id = %session_id,
            active_session = %denied.active_session,
            "Deployment rejected, slot is busy"
        );
        ApiError::from(denied)
    })?;

    let request = DeploymentRequest::new(session_id.clone(), body.playbook);
    let record = services::deploy::start(state.clone(), permit, request).await;

    Ok(Json(DeployResponse {
        log_stream_url: format!("/exam-sessions/{}/kubespray/deploy/logs/stream", session_id),
        session_id,
        status: record.status.as_str().to_string(),
        playbook: record.playbook,
        started_at: record.started_at,
    }))
}

/// 查询部署状态
///
/// GET /exam-sessions/:id/kubespray/deploy/status
async fn get_deploy_status(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<DeploymentStatus>> {
    state
        .status_store
        .get(&session_id)
        .await
        .map(Json)
        .ok_or_else(|| {
            ApiError::not_found(format!("Deployment status for session '{}'", session_id))
        })
}

/// 流式日志
///
/// GET /exam-sessions/:id/kubespray/deploy/logs/stream
///
/// 订阅在响应返回前完成；收到终态状态事件或服务关闭时结束流
async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let mut subscription = state.event_bus.subscribe(&session_id);
    let shutdown = state.shutdown.clone();
    info!(session_id = %session_id, "SSE log stream attached");

    let stream = async_stream::stream! {
        let connected = serde_json::json!({
            "session_id": session_id,
            "status": "connected",
        });
        yield Ok::<_, Infallible>(Event::default().event("connected").data(connected.to_string()));

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(session_id = %session_id, "Shutting down, closing SSE log stream");
                    None
                }
                event = subscription.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            let terminal = event.is_terminal();
            match event.data() {
                Ok(data) => {
                    yield Ok(Event::default().event(event.event_type()).data(data.to_string()));
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Failed to encode event, dropped");
                }
            }
            if terminal {
                break;
            }
        }

        subscription.unsubscribe();
        debug!(session_id = %session_id, "SSE log stream closed");
    };

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(stream).keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(SSE_KEEPALIVE_SECS))
                .text("keepalive"),
        ),
    )
}
