//! 部署相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 默认 playbook
pub const DEFAULT_PLAYBOOK: &str = "cluster.yml";

/// 部署状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    Pending,
    Started,
    Running,
    Completed,
    Failed,
}

impl DeployStatus {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStatus::Pending => "pending",
            DeployStatus::Started => "started",
            DeployStatus::Running => "running",
            DeployStatus::Completed => "completed",
            DeployStatus::Failed => "failed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeployStatus::Completed | DeployStatus::Failed)
    }

    /// 根据进程退出码得到终态
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            DeployStatus::Completed
        } else {
            DeployStatus::Failed
        }
    }
}

/// 部署请求
#[derive(Clone, Debug, Deserialize)]
pub struct DeploymentRequest {
    pub session_id: String,
    pub playbook: String,
}

impl DeploymentRequest {
    pub fn new(session_id: impl Into<String>, playbook: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            playbook: playbook.into(),
        }
    }
}

/// 部署状态记录（每个会话一条，存于 StatusStore）
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeploymentStatus {
    pub session_id: String,
    pub status: DeployStatus,
    pub playbook: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

impl DeploymentStatus {
    /// 创建 started 状态的新记录
    pub fn started(request: &DeploymentRequest) -> Self {
        Self {
            session_id: request.session_id.clone(),
            status: DeployStatus::Started,
            playbook: request.playbook.clone(),
            started_at: Utc::now(),
            completed_at: None,
            exit_code: None,
        }
    }

    /// 推进状态
    ///
    /// 进入终态时记录完成时间
    pub fn transition(&mut self, status: DeployStatus, exit_code: Option<i32>) {
        self.status = status;
        if exit_code.is_some() {
            self.exit_code = exit_code;
        }
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
    }
}

/// 日志事件
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LogEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

/// 状态事件
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StatusEvent {
    pub status: DeployStatus,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&DeploymentStatus> for StatusEvent {
    fn from(record: &DeploymentStatus) -> Self {
        Self {
            status: record.status,
            session_id: record.session_id.clone(),
            exit_code: record.exit_code,
            completed_at: record.completed_at,
        }
    }
}

/// 错误事件（监督进程内部异常）
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorEvent {
    pub session_id: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl ErrorEvent {
    pub fn new(session_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            error: error.into(),
            failed_at: Utc::now(),
        }
    }
}

/// 事件总线上的事件
#[derive(Clone, Debug, PartialEq)]
pub enum DeployEvent {
    Log(LogEvent),
    Status(StatusEvent),
    Error(ErrorEvent),
}

impl DeployEvent {
    /// 事件类型（SSE event 名 / WebSocket type）
    pub fn event_type(&self) -> &'static str {
        match self {
            DeployEvent::Log(_) => "log",
            DeployEvent::Status(_) => "status",
            DeployEvent::Error(_) => "error",
        }
    }

    /// 事件负载
    pub fn data(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            DeployEvent::Log(e) => serde_json::to_value(e),
            DeployEvent::Status(e) => serde_json::to_value(e),
            DeployEvent::Error(e) => serde_json::to_value(e),
        }
    }

    /// 是否为终态状态事件（流应在此关闭）
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeployEvent::Status(e) if e.status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_status_as_str() {
        assert_eq!(DeployStatus::Started.as_str(), "started");
        assert_eq!(DeployStatus::Completed.as_str(), "completed");
        assert_eq!(
            serde_json::to_value(DeployStatus::Failed).unwrap(),
            serde_json::json!("failed")
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(!DeployStatus::Running.is_terminal());
        assert!(DeployStatus::Completed.is_terminal());
        assert!(DeployStatus::Failed.is_terminal());
        assert_eq!(DeployStatus::from_exit_code(0), DeployStatus::Completed);
        assert_eq!(DeployStatus::from_exit_code(2), DeployStatus::Failed);
    }

    #[test]
    fn test_transition_sets_completed_at() {
        let request = DeploymentRequest::new("s-1", DEFAULT_PLAYBOOK);
        let mut record = DeploymentStatus::started(&request);

        record.transition(DeployStatus::Running, None);
        assert!(record.completed_at.is_none());
        assert!(record.exit_code.is_none());

        record.transition(DeployStatus::Failed, Some(2));
        assert_eq!(record.exit_code, Some(2));
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn test_event_payloads() {
        let log = DeployEvent::Log(LogEvent::new("TASK [bootstrap]"));
        assert_eq!(log.event_type(), "log");
        assert_eq!(log.data().unwrap()["message"], "TASK [bootstrap]");
        assert!(!log.is_terminal());

        let running = DeployEvent::Status(StatusEvent {
            status: DeployStatus::Running,
            session_id: "s-1".into(),
            exit_code: None,
            completed_at: None,
        });
        assert!(!running.is_terminal());
        assert!(running.data().unwrap().get("exit_code").is_none());

        let done = DeployEvent::Status(StatusEvent {
            status: DeployStatus::Completed,
            session_id: "s-1".into(),
            exit_code: Some(0),
            completed_at: Some(Utc::now()),
        });
        assert!(done.is_terminal());
        assert_eq!(done.data().unwrap()["status"], "completed");
    }
}
