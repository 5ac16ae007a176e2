//! inventory 生成 API
//!
//! POST /exam-sessions/:id/kubespray/inventory

use axum::{
    body::Bytes,
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

use crate::domain::cluster::ClusterTopology;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// 生成请求
#[derive(Debug, Deserialize)]
pub struct InventoryRequest {
    /// 仅用于核对，目录名以路径中的会话 ID 为准
    #[serde(default)]
    pub session_id: Option<String>,
    pub vm_config: ClusterTopology,
    #[serde(default)]
    pub question_set_id: Option<String>,
}

/// 生成响应
#[derive(Debug, Serialize)]
pub struct InventoryResponse {
    pub session_id: String,
    pub inventory_path: String,
    /// 相对 inventory 根目录的文件路径
    pub generated_files: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// 创建 inventory 路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/exam-sessions/:id/kubespray/inventory", post(generate_inventory))
}

/// 解析请求体，格式错误按统一的 JSON 错误返回
fn parse_request(body: &Bytes) -> ApiResult<InventoryRequest> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request(format!("Invalid inventory request body: {}", e)))
}

/// 生成 inventory
async fn generate_inventory(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<InventoryResponse>> {
    let request = parse_request(&body)?;
    if let Some(body_id) = request.session_id.as_deref() {
        if body_id != session_id {
            warn!(
                session_id = %session_id,
                body_session_id = %body_id,
                "Session id in body differs from path, using path"
            );
        }
    }

    let generated = state
        .generator
        .generate(
            &session_id,
            &request.vm_config,
            request.question_set_id.as_deref(),
        )
        .await
        .map_err(|e| {
            error!(session_id = %session_id, error = %e, "Inventory generation failed");
            e
        })?;

    let generated_files = generated
        .files
        .iter()
        .map(|path| state.generator.relative_path(path))
        .collect();

    Ok(Json(InventoryResponse {
        session_id,
        inventory_path: generated.output_dir.display().to_string(),
        generated_files,
        generated_at: Utc::now(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::env::EnvConfig;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn topology_body() -> serde_json::Value {
        serde_json::json!({
            "session_id": "s-1",
            "vm_config": {
                "nodes": [
                    {"name": "master-1", "ip": "10.0.0.1", "role": "master"},
                    {"name": "worker-1", "ip": "10.0.0.2", "role": "worker"}
                ],
                "ssh_config": {"user": "root", "port": 22}
            }
        })
    }

    #[tokio::test]
    async fn test_generate_inventory() {
        let tmp = TempDir::new().unwrap();
        let state = Arc::new(AppState::new(EnvConfig::with_kubespray_dir(tmp.path())));

        let response = router()
            .with_state(state.clone())
            .oneshot(post_json(
                "/exam-sessions/s-1/kubespray/inventory",
                topology_body(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["session_id"], "s-1");
        assert_eq!(body["generated_files"][0], "s-1/inventory.ini");
        assert!(state.generator.inventory_exists("s-1").await);
    }

    #[tokio::test]
    async fn test_invalid_session_id_is_bad_request() {
        let tmp = TempDir::new().unwrap();
        let state = Arc::new(AppState::new(EnvConfig::with_kubespray_dir(tmp.path())));

        let response = router()
            .with_state(state)
            .oneshot(post_json(
                "/exam-sessions/..%2Fescape/kubespray/inventory",
                topology_body(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_broken_override_is_internal_error() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("question_sets/cka/set-1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("base-overwrite.yml"), "- just\n- a list\n").unwrap();
        let state = Arc::new(AppState::new(EnvConfig::with_kubespray_dir(tmp.path())));

        let mut body = topology_body();
        body["question_set_id"] = "cka/set-1".into();
        let response = router()
            .with_state(state)
            .oneshot(post_json("/exam-sessions/s-1/kubespray/inventory", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_malformed_body_is_json_bad_request() {
        let tmp = TempDir::new().unwrap();
        let state = Arc::new(AppState::new(EnvConfig::with_kubespray_dir(tmp.path())));

        for body in ["{not json", r#"{"session_id": "s-1"}"#] {
            let response = router()
                .with_state(state.clone())
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/exam-sessions/s-1/kubespray/inventory")
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(Body::from(body))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);

            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(json["error"], "bad_request");
            assert!(json["message"]
                .as_str()
                .unwrap()
                .starts_with("Invalid inventory request body"));
        }
        assert!(!state.generator.inventory_exists("s-1").await);
    }

    #[tokio::test]
    async fn test_injected_node_name_is_bad_request() {
        let tmp = TempDir::new().unwrap();
        let state = Arc::new(AppState::new(EnvConfig::with_kubespray_dir(tmp.path())));

        let mut body = topology_body();
        body["vm_config"]["nodes"][1]["name"] = "w\n[kube_control_plane]\nx".into();
        let response = router()
            .with_state(state.clone())
            .oneshot(post_json("/exam-sessions/s-1/kubespray/inventory", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!state.generator.inventory_exists("s-1").await);
    }
}
