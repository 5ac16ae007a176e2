//! 部署上下文
//!
//! 单次部署运行期间的状态记录与事件发布

use std::sync::Arc;

use crate::domain::deploy::{
    DeployEvent, DeployStatus, DeploymentStatus, ErrorEvent, LogEvent, StatusEvent,
};
use crate::state::AppState;

/// 部署执行上下文
///
/// 由监督任务独占，状态记录只在这里被推进
pub struct DeployContext {
    /// 应用状态
    pub state: Arc<AppState>,
    /// 当前状态记录
    record: DeploymentStatus,
}

impl DeployContext {
    pub fn new(state: Arc<AppState>, record: DeploymentStatus) -> Self {
        Self { state, record }
    }

    /// 会话 ID
    pub fn session_id(&self) -> &str {
        &self.record.session_id
    }

    /// 发布一行日志
    pub fn log(&self, message: &str) {
        self.state
            .event_bus
            .publish(self.session_id(), DeployEvent::Log(LogEvent::new(message)));
    }

    /// 发布内部错误事件
    pub fn error(&self, error: &str) {
        self.state.event_bus.publish(
            self.session_id(),
            DeployEvent::Error(ErrorEvent::new(self.session_id(), error)),
        );
    }

    /// 推进状态：先写入状态存储，再发布状态事件
    ///
    /// 订阅方收到状态事件时，查询接口已能看到同一状态
    pub async fn update_status(&mut self, status: DeployStatus, exit_code: Option<i32>) {
        self.record.transition(status, exit_code);
        self.state.status_store.put(self.record.clone()).await;

        let event = StatusEvent::from(&self.record);
        self.state
            .event_bus
            .publish(self.session_id(), DeployEvent::Status(event));
    }

    /// 以退出码结束部署
    pub async fn finish(&mut self, exit_code: i32) {
        self.update_status(DeployStatus::from_exit_code(exit_code), Some(exit_code))
            .await;
    }

    /// 以内部错误结束部署
    pub async fn fail(&mut self, error: &str) {
        self.error(error);
        self.update_status(DeployStatus::Failed, Some(-1)).await;
    }
}
