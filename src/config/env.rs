//! 环境变量配置加载

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::infra::command::PlaybookCommand;

use self::constants::{DEFAULT_PORT, DEFAULT_STATUS_TTL_SECS};

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// 服务监听端口
    pub port: u16,
    /// kubespray 目录（playbook 的工作目录）
    pub kubespray_dir: PathBuf,
    /// inventory 输出根目录（每个会话一个子目录）
    pub inventory_dir: PathBuf,
    /// 题组配置根目录（templates/ 与 <exam_type>/<set_id>/）
    pub question_sets_dir: PathBuf,
    /// 写入 inventory 并传给 ansible 的 SSH 私钥路径
    pub ssh_private_key_path: PathBuf,
    /// 部署命令
    pub playbook_command: PlaybookCommand,
    /// 部署状态保留时间
    pub status_ttl: Duration,
    /// 上游实例的 WebSocket 地址，设置后 WebSocket 端点以隧道模式运行
    pub ws_upstream_url: Option<String>,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let kubespray_dir = env::var("KUBESPRAY_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/kubespray"));

        let mut config = Self::with_kubespray_dir(&kubespray_dir);
        config.port = port;

        if let Ok(dir) = env::var("KUBESPRAY_INVENTORY_DIR") {
            config.inventory_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = env::var("KUBESPRAY_QUESTION_SETS_DIR") {
            config.question_sets_dir = PathBuf::from(dir);
        }
        if let Ok(path) = env::var("SSH_PRIVATE_KEY_PATH") {
            config.ssh_private_key_path = PathBuf::from(path);
        }

        if let Ok(raw) = env::var("ANSIBLE_PLAYBOOK_CMD") {
            match PlaybookCommand::parse(&raw) {
                Some(cmd) => config.playbook_command = cmd,
                None => warn!(value = %raw, "Empty ANSIBLE_PLAYBOOK_CMD, using ansible-playbook"),
            }
        }

        config.status_ttl = env::var("DEPLOY_STATUS_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(config.status_ttl);

        config.ws_upstream_url = env::var("WS_UPSTREAM_URL")
            .ok()
            .map(|v| v.trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty());

        config
    }

    /// 以指定 kubespray 目录构建默认配置
    ///
    /// inventory 与题组目录位于其下
    pub fn with_kubespray_dir(kubespray_dir: &Path) -> Self {
        Self {
            port: DEFAULT_PORT,
            kubespray_dir: kubespray_dir.to_path_buf(),
            inventory_dir: kubespray_dir.join("inventory"),
            question_sets_dir: kubespray_dir.join("question_sets"),
            ssh_private_key_path: PathBuf::from("/root/.ssh/id_rsa"),
            playbook_command: PlaybookCommand::default(),
            status_ttl: Duration::from_secs(DEFAULT_STATUS_TTL_SECS),
            ws_upstream_url: None,
        }
    }

    /// WebSocket 是否以隧道模式运行
    pub fn is_tunnel_mode(&self) -> bool {
        self.ws_upstream_url.is_some()
    }
}

/// 常量
pub mod constants {
    /// 默认监听端口
    pub const DEFAULT_PORT: u16 = 8080;

    /// 部署状态默认保留时间（秒）
    pub const DEFAULT_STATUS_TTL_SECS: u64 = 3600; // 1 小时

    /// 后台清理间隔（秒）
    pub const CLEANUP_INTERVAL_SECS: u64 = 60;

    /// 每个会话事件通道的容量
    pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

    /// SSE keep-alive 间隔（秒）
    pub const SSE_KEEPALIVE_SECS: u64 = 15;

    /// 每个 WebSocket 连接的出站队列容量
    pub const WS_OUTBOUND_CAPACITY: usize = 256;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_kubespray_dir_layout() {
        let config = EnvConfig::with_kubespray_dir(Path::new("/opt/kubespray"));

        assert_eq!(config.inventory_dir, PathBuf::from("/opt/kubespray/inventory"));
        assert_eq!(
            config.question_sets_dir,
            PathBuf::from("/opt/kubespray/question_sets")
        );
        assert_eq!(config.status_ttl, Duration::from_secs(3600));
        assert_eq!(config.playbook_command.program, "ansible-playbook");
        assert!(!config.is_tunnel_mode());
    }
}
