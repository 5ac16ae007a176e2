//! Kubespray inventory 生成
//!
//! 把集群拓扑和可选的题组覆盖配置转换成 kubespray 使用的文件树：
//!
//! ```text
//! <inventory_dir>/<session_id>/
//! ├── inventory.ini
//! └── group_vars/
//!     ├── all/
//!     │   ├── all.yml          连接参数
//!     │   └── etcd.yml         (templates/all/etcd.yml 存在时复制)
//!     └── k8s_cluster/
//!         ├── k8s-cluster.yml  基础模板 + 题组覆盖
//!         ├── addons.yml       (templates/addons.yml 存在时复制)
//!         └── *.yml            (题组 network/ 目录下的文件)
//! ```
//!
//! 同一会话重新生成时原地覆盖，写入过程不是原子的。

pub mod merge;

use serde::Serialize;
use serde_yaml::Value;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::env::EnvConfig;
use crate::domain::cluster::{ClusterTopology, SshConfig};

use self::merge::{deep_merge, empty_document};

/// inventory 文件名
pub const INVENTORY_FILE: &str = "inventory.ini";

/// 关闭主机密钥校验的 SSH 参数
///
/// 仅适用于考试用的一次性集群；同一份 inventory 若用于长期环境会暴露于中间人攻击
pub const INSECURE_SSH_COMMON_ARGS: &str =
    "-o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null";

/// 生成错误
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("Invalid question set id: {0:?}")]
    InvalidQuestionSet(String),

    #[error("Invalid node name: {0:?}")]
    InvalidNodeName(String),

    #[error("Invalid address {ip:?} for node {node:?}")]
    InvalidNodeAddress { node: String, ip: String },

    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{} must contain a YAML mapping", .path.display())]
    NotAMapping { path: PathBuf },

    #[error("Failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize {name}: {source}")]
    Serialize {
        name: &'static str,
        #[source]
        source: serde_yaml::Error,
    },
}

impl GenerateError {
    /// 是否由请求参数引起
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            GenerateError::InvalidSessionId(_)
                | GenerateError::InvalidQuestionSet(_)
                | GenerateError::InvalidNodeName(_)
                | GenerateError::InvalidNodeAddress { .. }
        )
    }
}

/// 生成结果
#[derive(Debug, Clone)]
pub struct GeneratedInventory {
    /// 会话目录
    pub output_dir: PathBuf,
    /// 实际写入的文件（按写入顺序）
    pub files: Vec<PathBuf>,
}

/// 连接参数（group_vars/all/all.yml）
///
/// 字段按字母序声明，输出稳定
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConnectionVars {
    pub ansible_ssh_common_args: String,
    pub ansible_ssh_port: u16,
    pub ansible_ssh_private_key_file: String,
    pub ansible_user: String,
    pub bootstrap_os: String,
}

impl ConnectionVars {
    pub fn new(ssh: &SshConfig, private_key_path: &Path) -> Self {
        Self {
            ansible_ssh_common_args: INSECURE_SSH_COMMON_ARGS.to_string(),
            ansible_ssh_port: ssh.port,
            ansible_ssh_private_key_file: private_key_path.display().to_string(),
            ansible_user: ssh.user.clone(),
            bootstrap_os: "ubuntu".to_string(),
        }
    }
}

/// 题组引用：`<exam_type>/<set_id>`
#[derive(Debug, Clone, PartialEq)]
pub struct QuestionSetRef {
    pub exam_type: String,
    pub set_id: String,
}

impl QuestionSetRef {
    /// 解析题组 ID
    ///
    /// 不足两段时返回 Ok(None)，包含非法路径片段时返回错误
    pub fn parse(id: &str) -> Result<Option<Self>, GenerateError> {
        let mut parts = id.trim_matches('/').split('/');
        let (Some(exam_type), Some(set_id)) = (parts.next(), parts.next()) else {
            return Ok(None);
        };
        if exam_type.is_empty() || set_id.is_empty() {
            return Ok(None);
        }
        if !is_safe_segment(exam_type) || !is_safe_segment(set_id) {
            return Err(GenerateError::InvalidQuestionSet(id.to_string()));
        }
        Ok(Some(Self {
            exam_type: exam_type.to_string(),
            set_id: set_id.to_string(),
        }))
    }

    /// 题组目录
    pub fn dir(&self, question_sets_dir: &Path) -> PathBuf {
        question_sets_dir.join(&self.exam_type).join(&self.set_id)
    }
}

/// 路径片段只允许字母数字与 `-_.`，且不能是 `.`/`..`
fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// 校验会话 ID 可以安全地作为目录名
pub fn validate_session_id(session_id: &str) -> Result<(), GenerateError> {
    if is_safe_segment(session_id) {
        Ok(())
    } else {
        Err(GenerateError::InvalidSessionId(session_id.to_string()))
    }
}

/// 主机名：字母数字与 `-_.`，不能以 `-` 开头
fn is_valid_host_token(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('-')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// 校验节点名与地址可以原样写入 inventory.ini
///
/// 地址接受 IP 字面量或主机名
pub fn validate_topology(topology: &ClusterTopology) -> Result<(), GenerateError> {
    for node in &topology.nodes {
        if !is_valid_host_token(&node.name) {
            return Err(GenerateError::InvalidNodeName(node.name.clone()));
        }
        if node.ip.parse::<IpAddr>().is_err() && !is_valid_host_token(&node.ip) {
            return Err(GenerateError::InvalidNodeAddress {
                node: node.name.clone(),
                ip: node.ip.clone(),
            });
        }
    }
    Ok(())
}

/// 渲染 inventory.ini
///
/// 纯函数：相同拓扑得到逐字节相同的输出。调用前须经过 [`validate_topology`]
pub fn render_inventory(topology: &ClusterTopology) -> String {
    let mut out = String::from("# Kubespray inventory file\n\n[all]\n");
    for node in &topology.nodes {
        out.push_str(&format!(
            "{} ansible_host={} ip={}\n",
            node.name, node.ip, node.ip
        ));
    }

    out.push_str("\n[kube_control_plane]\n");
    for node in topology.masters() {
        out.push_str(&node.name);
        out.push('\n');
    }

    // etcd 与控制平面相同
    out.push_str("\n[etcd]\n");
    for node in topology.masters() {
        out.push_str(&node.name);
        out.push('\n');
    }

    out.push_str("\n[kube_node]\n");
    for node in &topology.nodes {
        out.push_str(&node.name);
        out.push('\n');
    }

    out.push_str("\n[calico_rr]\n");
    out.push_str("\n[k8s_cluster:children]\nkube_control_plane\nkube_node\ncalico_rr\n");
    out
}

/// inventory 生成器
#[derive(Debug, Clone)]
pub struct InventoryGenerator {
    inventory_dir: PathBuf,
    question_sets_dir: PathBuf,
    ssh_private_key_path: PathBuf,
}

impl InventoryGenerator {
    pub fn new(
        inventory_dir: impl Into<PathBuf>,
        question_sets_dir: impl Into<PathBuf>,
        ssh_private_key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inventory_dir: inventory_dir.into(),
            question_sets_dir: question_sets_dir.into(),
            ssh_private_key_path: ssh_private_key_path.into(),
        }
    }

    pub fn from_config(config: &EnvConfig) -> Self {
        Self::new(
            &config.inventory_dir,
            &config.question_sets_dir,
            &config.ssh_private_key_path,
        )
    }

    /// inventory 根目录
    pub fn inventory_dir(&self) -> &Path {
        &self.inventory_dir
    }

    /// 会话目录
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.inventory_dir.join(session_id)
    }

    /// 会话的 inventory.ini 路径
    pub fn inventory_file(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(INVENTORY_FILE)
    }

    /// 会话的 inventory 是否已生成
    pub async fn inventory_exists(&self, session_id: &str) -> bool {
        if validate_session_id(session_id).is_err() {
            return false;
        }
        tokio::fs::metadata(self.inventory_file(session_id))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// 相对 inventory 根目录的路径，无法计算时返回原路径
    pub fn relative_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.inventory_dir)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    /// 为会话生成 kubespray 配置
    pub async fn generate(
        &self,
        session_id: &str,
        topology: &ClusterTopology,
        question_set_id: Option<&str>,
    ) -> Result<GeneratedInventory, GenerateError> {
        validate_session_id(session_id)?;
        validate_topology(topology)?;
        let question_set = match question_set_id {
            Some(id) => {
                let parsed = QuestionSetRef::parse(id)?;
                if parsed.is_none() {
                    warn!(question_set_id = %id, "Question set id has no <exam_type>/<set_id> form, override skipped");
                }
                parsed
            }
            None => None,
        };

        info!(
            session_id = %session_id,
            nodes = topology.nodes.len(),
            question_set = ?question_set_id,
            "Generating kubespray inventory"
        );

        let session_dir = self.session_dir(session_id);
        let all_dir = session_dir.join("group_vars").join("all");
        let cluster_dir = session_dir.join("group_vars").join("k8s_cluster");
        create_dir(&all_dir).await?;
        create_dir(&cluster_dir).await?;

        let mut files = Vec::new();

        // 1. inventory.ini
        let inventory_path = session_dir.join(INVENTORY_FILE);
        write_file(&inventory_path, render_inventory(topology)).await?;
        files.push(inventory_path);

        // 2. group_vars/all/all.yml
        let vars = ConnectionVars::new(&topology.ssh, &self.ssh_private_key_path);
        let vars_yaml = serde_yaml::to_string(&vars).map_err(|source| GenerateError::Serialize {
            name: "all.yml",
            source,
        })?;
        let vars_path = all_dir.join("all.yml");
        write_file(&vars_path, vars_yaml).await?;
        files.push(vars_path);

        // 3. etcd 配置
        let templates_dir = self.question_sets_dir.join("templates");
        copy_if_exists(
            &templates_dir.join("all").join("etcd.yml"),
            &all_dir.join("etcd.yml"),
            &mut files,
        )
        .await?;

        // 4. k8s-cluster.yml
        let cluster_options = self.build_cluster_options(question_set.as_ref()).await?;
        let options_yaml =
            serde_yaml::to_string(&cluster_options).map_err(|source| GenerateError::Serialize {
                name: "k8s-cluster.yml",
                source,
            })?;
        let options_path = cluster_dir.join("k8s-cluster.yml");
        write_file(&options_path, options_yaml).await?;
        files.push(options_path);

        // 5. addons.yml
        copy_if_exists(
            &templates_dir.join("addons.yml"),
            &cluster_dir.join("addons.yml"),
            &mut files,
        )
        .await?;

        // 6. 题组网络配置
        if let Some(question_set) = &question_set {
            self.copy_network_configs(question_set, &cluster_dir, &mut files)
                .await?;
        }

        info!(
            session_id = %session_id,
            files = files.len(),
            "Kubespray inventory generated"
        );

        Ok(GeneratedInventory {
            output_dir: session_dir,
            files,
        })
    }

    /// 基础模板 + 题组覆盖
    async fn build_cluster_options(
        &self,
        question_set: Option<&QuestionSetRef>,
    ) -> Result<Value, GenerateError> {
        let base_path = self.question_sets_dir.join("templates").join("base.yml");
        let mut options = match load_mapping(&base_path).await? {
            Some(doc) => {
                info!(path = %base_path.display(), "Loaded base template");
                doc
            }
            None => {
                warn!(path = %base_path.display(), "Base template not found, using empty options");
                empty_document()
            }
        };

        if let Some(question_set) = question_set {
            let override_path = question_set
                .dir(&self.question_sets_dir)
                .join("base-overwrite.yml");
            match load_mapping(&override_path).await? {
                Some(overlay) => {
                    deep_merge(&mut options, overlay);
                    info!(path = %override_path.display(), "Applied question set override");
                }
                None => {
                    warn!(path = %override_path.display(), "Question set override not found, using base template");
                }
            }
        }

        Ok(options)
    }

    /// 复制题组 network/ 目录下的 *.yml（按文件名排序）
    async fn copy_network_configs(
        &self,
        question_set: &QuestionSetRef,
        target_dir: &Path,
        files: &mut Vec<PathBuf>,
    ) -> Result<(), GenerateError> {
        let network_dir = question_set.dir(&self.question_sets_dir).join("network");
        let mut entries = match tokio::fs::read_dir(&network_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %network_dir.display(), "Question set has no network directory");
                return Ok(());
            }
            Err(source) => {
                return Err(GenerateError::Read {
                    path: network_dir,
                    source,
                })
            }
        };

        let mut sources = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|source| GenerateError::Read {
                path: network_dir.clone(),
                source,
            })?;
            let Some(entry) = entry else { break };

            let path = entry.path();
            let is_yaml = path.extension().map_or(false, |ext| ext == "yml");
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_yaml && is_file {
                sources.push(path);
            }
        }
        sources.sort();

        for source in sources {
            if let Some(name) = source.file_name() {
                let target = target_dir.join(name);
                copy_file(&source, &target).await?;
                info!(file = %name.to_string_lossy(), "Copied network config");
                files.push(target);
            }
        }

        Ok(())
    }
}

/// 读取 YAML 映射文档
///
/// 文件不存在返回 Ok(None)，空文档视为空映射
async fn load_mapping(path: &Path) -> Result<Option<Value>, GenerateError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(GenerateError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let doc: Value = serde_yaml::from_str(&text).map_err(|source| GenerateError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    match doc {
        Value::Null => Ok(Some(empty_document())),
        Value::Mapping(_) => Ok(Some(doc)),
        _ => Err(GenerateError::NotAMapping {
            path: path.to_path_buf(),
        }),
    }
}

async fn create_dir(path: &Path) -> Result<(), GenerateError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| GenerateError::Write {
            path: path.to_path_buf(),
            source,
        })
}

async fn write_file(path: &Path, contents: String) -> Result<(), GenerateError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| GenerateError::Write {
            path: path.to_path_buf(),
            source,
        })
}

async fn copy_file(from: &Path, to: &Path) -> Result<(), GenerateError> {
    tokio::fs::copy(from, to)
        .await
        .map(|_| ())
        .map_err(|source| GenerateError::Write {
            path: to.to_path_buf(),
            source,
        })
}

async fn copy_if_exists(
    from: &Path,
    to: &Path,
    files: &mut Vec<PathBuf>,
) -> Result<(), GenerateError> {
    let exists = tokio::fs::metadata(from)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if exists {
        copy_file(from, to).await?;
        files.push(to.to_path_buf());
    }
    Ok(())
}
