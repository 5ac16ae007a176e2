//! WebSocket 日志通道消息模型
//!
//! 出站统一使用 `{type, session_id, data, timestamp}` 信封

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::deploy::{DeployEvent, DeploymentStatus};

/// 出站消息信封
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub session_id: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl WsEnvelope {
    pub fn new(kind: impl Into<String>, session_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            session_id: session_id.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn connected(session_id: &str) -> Self {
        Self::new(
            "connected",
            session_id,
            json!({ "message": "WebSocket connection established" }),
        )
    }

    pub fn pong(session_id: &str) -> Self {
        Self::new("pong", session_id, Value::Null)
    }

    pub fn error(session_id: &str, message: impl Into<String>) -> Self {
        Self::new("error", session_id, json!({ "message": message.into() }))
    }

    pub fn status(status: &DeploymentStatus) -> serde_json::Result<Self> {
        Ok(Self::new(
            "status",
            status.session_id.as_str(),
            serde_json::to_value(status)?,
        ))
    }

    pub fn command_received(session_id: &str, command: Value) -> Self {
        let message = match &command {
            Value::String(s) => format!("Command received: {}", s),
            other => format!("Command received: {}", other),
        };
        Self::new(
            "command_received",
            session_id,
            json!({ "command": command, "message": message }),
        )
    }

    /// 将总线事件转换为信封
    pub fn from_event(session_id: &str, event: &DeployEvent) -> serde_json::Result<Self> {
        Ok(Self::new(event.event_type(), session_id, event.data()?))
    }
}

/// 入站控制消息
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    Ping,
    GetStatus,
    /// 仅回显确认，不影响正在运行的部署
    Command(Value),
}

/// 入站消息解析错误
#[derive(Debug, PartialEq)]
pub enum ClientMessageError {
    /// 不是合法的 JSON 对象
    Malformed,
    /// 未知的消息类型
    UnknownType(String),
}

impl ClientMessage {
    /// 解析入站文本帧
    ///
    /// `command` 字段可以位于顶层或 `data` 中
    pub fn parse(text: &str) -> Result<Self, ClientMessageError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ClientMessageError::Malformed)?;
        let obj = value.as_object().ok_or(ClientMessageError::Malformed)?;

        let kind = obj.get("type").and_then(Value::as_str).unwrap_or_default();
        match kind {
            "ping" => Ok(ClientMessage::Ping),
            "get_status" => Ok(ClientMessage::GetStatus),
            "command" => {
                let command = obj
                    .get("command")
                    .or_else(|| obj.get("data").and_then(|d| d.get("command")))
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(ClientMessage::Command(command))
            }
            other => Err(ClientMessageError::UnknownType(other.to_string())),
        }
    }
}
