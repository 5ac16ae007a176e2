//! 部署状态存储
//!
//! 每个会话一条状态记录，写入时附带过期时间，过期后视为不存在

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::domain::deploy::DeploymentStatus;

/// 带过期时间的记录
struct StatusEntry {
    status: DeploymentStatus,
    expires_at: DateTime<Utc>,
}

impl StatusEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// 状态存储
///
/// 最后写入者获胜，没有乐观并发控制：全局只会有一个监督进程在写
pub struct StatusStore {
    /// 会话记录 (session_id -> StatusEntry)
    entries: RwLock<HashMap<String, StatusEntry>>,
    /// 默认保留时间
    default_ttl: Duration,
}

impl StatusStore {
    /// 创建新的状态存储
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    /// 获取会话状态
    ///
    /// 不存在或已过期返回 None，读取没有副作用
    pub async fn get(&self, session_id: &str) -> Option<DeploymentStatus> {
        let entries = self.entries.read().await;
        entries
            .get(session_id)
            .filter(|entry| !entry.is_expired(Utc::now()))
            .map(|entry| entry.status.clone())
    }

    /// 写入会话状态（无条件覆盖）
    pub async fn set(&self, session_id: &str, status: DeploymentStatus, ttl: Duration) {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        let expires_at = Utc::now() + ttl;

        let mut entries = self.entries.write().await;
        entries.insert(session_id.to_string(), StatusEntry { status, expires_at });
    }

    /// 使用默认保留时间写入
    pub async fn put(&self, status: DeploymentStatus) {
        let session_id = status.session_id.clone();
        self.set(&session_id, status, self.default_ttl).await;
    }

    /// 清理过期记录，返回清理数量
    pub async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// 记录数量（包括尚未清理的过期记录）
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::deploy::{DeployStatus, DeploymentRequest};

    fn record(session_id: &str) -> DeploymentStatus {
        DeploymentStatus::started(&DeploymentRequest::new(session_id, "cluster.yml"))
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = StatusStore::new(Duration::from_secs(60));
        assert!(store.get("s-1").await.is_none());

        store.put(record("s-1")).await;

        let first = store.get("s-1").await.unwrap();
        let second = store.get("s-1").await.unwrap();
        assert_eq!(first.status, DeployStatus::Started);
        // 重复读取结果一致
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let store = StatusStore::new(Duration::from_secs(60));
        let mut status = record("s-1");
        store.put(status.clone()).await;

        status.transition(DeployStatus::Completed, Some(0));
        store.put(status).await;

        let stored = store.get("s-1").await.unwrap();
        assert_eq!(stored.status, DeployStatus::Completed);
        assert_eq!(stored.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_expired_record_is_absent() {
        let store = StatusStore::new(Duration::from_secs(60));
        store
            .set("s-1", record("s-1"), Duration::from_millis(50))
            .await;
        assert!(store.get("s-1").await.is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(store.get("s-1").await.is_none());
        assert_eq!(store.cleanup_expired().await, 1);
        assert!(store.is_empty().await);
    }
}
