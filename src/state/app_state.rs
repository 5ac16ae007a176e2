//! 应用状态

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 全局 shutdown token，用于优雅关闭所有后台任务
static GLOBAL_SHUTDOWN: std::sync::OnceLock<CancellationToken> = std::sync::OnceLock::new();

/// 获取全局 shutdown token
pub fn get_shutdown_token() -> CancellationToken {
    GLOBAL_SHUTDOWN
        .get_or_init(CancellationToken::new)
        .clone()
}

/// 触发全局 shutdown
pub fn trigger_shutdown() {
    if let Some(token) = GLOBAL_SHUTDOWN.get() {
        token.cancel();
    }
}

use crate::config::env::EnvConfig;
use crate::services::inventory::InventoryGenerator;

use super::admission::AdmissionController;
use super::event_bus::EventBus;
use super::status_store::StatusStore;
use super::ws_registry::ConnectionRegistry;

/// 应用状态
pub struct AppState {
    // ========== 核心配置 ==========
    /// 环境配置
    pub config: EnvConfig,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,

    // ========== 配置生成 ==========
    /// inventory 生成器
    pub generator: InventoryGenerator,

    // ========== 部署管理 ==========
    /// 全局部署名额
    pub admission: Arc<AdmissionController>,
    /// 部署状态存储
    pub status_store: StatusStore,
    /// 事件总线
    pub event_bus: Arc<EventBus>,

    // ========== 实时通道 ==========
    /// WebSocket 连接注册表（hub 模式）
    pub ws_registry: Arc<ConnectionRegistry>,

    /// 长连接的关闭信号，全局 shutdown 时一并取消
    pub shutdown: CancellationToken,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(config: EnvConfig) -> Self {
        tracing::info!(
            port = config.port,
            kubespray_dir = %config.kubespray_dir.display(),
            inventory_dir = %config.inventory_dir.display(),
            question_sets_dir = %config.question_sets_dir.display(),
            playbook_command = %config.playbook_command.program,
            status_ttl_secs = config.status_ttl.as_secs(),
            ws_upstream = ?config.ws_upstream_url,
            "Loaded configuration"
        );

        // 名额不做持久化：上一个进程遗留的部署不再被跟踪
        tracing::info!("Deployment slot starts empty; runs from a previous process are not tracked");

        let event_bus = Arc::new(EventBus::new());

        Self {
            generator: InventoryGenerator::from_config(&config),
            started_at: Utc::now(),

            admission: Arc::new(AdmissionController::new()),
            status_store: StatusStore::new(config.status_ttl),
            ws_registry: Arc::new(ConnectionRegistry::new(event_bus.clone())),
            event_bus,
            shutdown: get_shutdown_token().child_token(),

            config,
        }
    }

    /// 运行时长（秒）
    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
