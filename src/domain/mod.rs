//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod cluster;
pub mod deploy;
pub mod ws;

// Re-exports for convenience
pub use cluster::{ClusterTopology, NodeRole, SshConfig, VmNode};
pub use deploy::{
    DeployEvent, DeployStatus, DeploymentRequest, DeploymentStatus, ErrorEvent, LogEvent,
    StatusEvent, DEFAULT_PLAYBOOK,
};
pub use ws::{ClientMessage, ClientMessageError, WsEnvelope};
