//! 集群拓扑领域模型
//!
//! 考生提供的 VM 节点与 SSH 连接参数，是 inventory 生成的只读输入

use serde::{Deserialize, Serialize};

/// 节点角色
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Master,
    Worker,
}

/// VM 节点
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VmNode {
    pub name: String,
    pub ip: String,
    pub role: NodeRole,
}

impl VmNode {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, role: NodeRole) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            role,
        }
    }

    pub fn is_master(&self) -> bool {
        self.role == NodeRole::Master
    }
}

/// SSH 连接配置
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            port: default_ssh_port(),
        }
    }
}

/// 集群拓扑
///
/// 请求体中的 `vm_config` 字段，`name` 仅用于展示
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClusterTopology {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub nodes: Vec<VmNode>,
    #[serde(default, rename = "ssh_config")]
    pub ssh: SshConfig,
}

impl ClusterTopology {
    /// 所有 master 节点（保持输入顺序）
    pub fn masters(&self) -> impl Iterator<Item = &VmNode> {
        self.nodes.iter().filter(|n| n.is_master())
    }
}
