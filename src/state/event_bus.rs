//! 部署事件总线
//!
//! 每个会话一个广播通道，发布即忘：不保留历史，订阅之前发布的事件不会被收到。
//! 没有订阅者的通道会被移除。

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::warn;

use crate::config::env::constants::EVENT_CHANNEL_CAPACITY;
use crate::domain::deploy::DeployEvent;

/// 事件总线
pub struct EventBus {
    /// 通道映射 (session_id -> sender)
    channels: RwLock<HashMap<String, broadcast::Sender<DeployEvent>>>,
    /// 每个通道的容量
    capacity: usize,
}

/// 订阅游标
///
/// `unsubscribe` 可重复调用，Drop 时自动执行
pub struct Subscription {
    bus: Arc<EventBus>,
    session_id: String,
    receiver: Option<broadcast::Receiver<DeployEvent>>,
}

impl EventBus {
    /// 创建新的事件总线
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    /// 使用自定义通道容量创建
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, broadcast::Sender<DeployEvent>>> {
        self.channels.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, broadcast::Sender<DeployEvent>>> {
        self.channels.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 发布事件
    ///
    /// 返回收到事件的订阅者数量；没有订阅者时事件直接丢弃
    pub fn publish(&self, session_id: &str, event: DeployEvent) -> usize {
        let channels = self.read();
        match channels.get(session_id) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// 订阅会话通道
    ///
    /// 通道不存在时创建
    pub fn subscribe(self: &Arc<Self>, session_id: &str) -> Subscription {
        let mut channels = self.write();
        let receiver = match channels.get(session_id) {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(self.capacity);
                channels.insert(session_id.to_string(), sender);
                receiver
            }
        };

        Subscription {
            bus: self.clone(),
            session_id: session_id.to_string(),
            receiver: Some(receiver),
        }
    }

    /// 移除没有订阅者的通道
    fn prune(&self, session_id: &str) {
        let mut channels = self.write();
        if channels
            .get(session_id)
            .map_or(false, |sender| sender.receiver_count() == 0)
        {
            channels.remove(session_id);
        }
    }

    /// 清理所有没有订阅者的通道，返回清理数量
    pub fn cleanup(&self) -> usize {
        let mut channels = self.write();
        let before = channels.len();
        channels.retain(|_, sender| sender.receiver_count() > 0);
        before - channels.len()
    }

    /// 会话的订阅者数量
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.read()
            .get(session_id)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// 通道数量
    pub fn channel_count(&self) -> usize {
        self.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscription {
    /// 订阅的会话
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 接收下一个事件
    ///
    /// 消费过慢丢失的事件只记录日志，之后继续接收；已取消订阅时返回 None
    pub async fn recv(&mut self) -> Option<DeployEvent> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(session_id = %self.session_id, lagged = n, "Event subscriber lagged, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// 取消订阅
    pub fn unsubscribe(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            drop(receiver);
            self.bus.prune(&self.session_id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
