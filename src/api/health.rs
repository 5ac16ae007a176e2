//! 健康检查 API
//!
//! 包含 /health, / 端点

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::config::env::constants::VERSION;
use crate::state::AppState;

/// 健康检查响应
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// kubespray 目录存在
    pub kubespray_ready: bool,
    /// SSH 私钥已挂载
    pub ssh_keys_mounted: bool,
    /// inventory 目录存在且可写
    pub inventory_writable: bool,
    pub uptime_seconds: i64,
    pub version: &'static str,
    pub checked_at: DateTime<Utc>,
    /// 当前持有部署名额的会话
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_session: Option<String>,
}

/// 服务信息响应
#[derive(Debug, Serialize)]
struct InfoResponse {
    message: &'static str,
    version: &'static str,
    status: &'static str,
}

/// 创建健康检查路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health_check))
}

/// 服务信息
///
/// GET /
async fn service_info() -> impl IntoResponse {
    Json(InfoResponse {
        message: "Kubespray deployment agent",
        version: VERSION,
        status: "running",
    })
}

/// 健康检查
///
/// GET /health
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = &state.config;

    Json(HealthResponse {
        status: "healthy",
        kubespray_ready: is_dir(&config.kubespray_dir).await,
        ssh_keys_mounted: is_file(&config.ssh_private_key_path).await,
        inventory_writable: is_writable_dir(&config.inventory_dir).await,
        uptime_seconds: state.uptime_seconds(),
        version: VERSION,
        checked_at: Utc::now(),
        active_session: state.admission.current(),
    })
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn is_writable_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir() && !m.permissions().readonly())
        .unwrap_or(false)
}
