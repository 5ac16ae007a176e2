//! Kubespray Agent - 集群部署与日志推送服务
//!
//! 为考试会话生成 kubespray inventory，运行 ansible-playbook，
//! 并通过 SSE / WebSocket 实时推送部署日志

pub mod error;
pub mod infra;
pub mod domain;
pub mod config;
pub mod state;
pub mod api;
pub mod services;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use crate::config::env::constants::{CLEANUP_INTERVAL_SECS, VERSION};
use crate::config::EnvConfig;
use crate::state::app_state::{get_shutdown_token, trigger_shutdown};
use crate::state::AppState;

/// 命令行覆盖的运行参数
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// 覆盖 PORT 环境变量
    pub port_override: Option<u16>,
}

/// 初始化日志，`RUST_LOG` 优先
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kubespray_agent=debug"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// 初始化并运行服务，直到收到 Ctrl-C
pub async fn init_and_run_agent_with_config(runtime: RuntimeConfig) -> anyhow::Result<()> {
    init_tracing();

    let mut config = EnvConfig::from_env();
    if let Some(port) = runtime.port_override {
        config.port = port;
    }

    let state = Arc::new(AppState::new(config));
    let shutdown = get_shutdown_token();

    spawn_cleanup_task(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let ws_mode = if state.config.is_tunnel_mode() { "tunnel" } else { "hub" };
    tracing::info!(
        addr = %addr,
        version = VERSION,
        ws_mode,
        "Kubespray agent listening"
    );

    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C, shutting down");
            trigger_shutdown();
        }
    });

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server error")?;

    tracing::info!("Kubespray agent stopped");
    Ok(())
}

/// 定期清理过期状态与空闲事件通道
fn spawn_cleanup_task(state: Arc<AppState>) {
    let shutdown = get_shutdown_token();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let expired = state.status_store.cleanup_expired().await;
                    let channels = state.event_bus.cleanup();
                    if expired > 0 || channels > 0 {
                        tracing::debug!(expired, channels, "Cleanup completed");
                    }
                }
            }
        }
    });
}
