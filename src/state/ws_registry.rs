//! WebSocket 连接注册表
//!
//! 按会话组织的一对多连接表。每个会话只有一个转发任务订阅事件总线，
//! 并把事件广播给该会话的所有连接，因此同一事件不会被重复投递到某个连接。

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::ws::WsEnvelope;

use super::event_bus::{EventBus, Subscription};

/// 单个连接
struct Connection {
    /// 发送到该连接写任务的通道
    tx: mpsc::Sender<WsEnvelope>,
    /// 连接时间
    connected_at: DateTime<Utc>,
}

/// 会话房间
struct SessionRoom {
    connections: HashMap<String, Connection>,
    /// 总线 -> 连接 的转发任务
    forwarder: JoinHandle<()>,
}

/// 连接注册表
pub struct ConnectionRegistry {
    /// 会话房间 (session_id -> SessionRoom)
    rooms: RwLock<HashMap<String, SessionRoom>>,
    bus: Arc<EventBus>,
}

impl ConnectionRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// 注册连接，返回连接 ID
    ///
    /// 会话的第一个连接会启动转发任务。订阅在返回前完成，
    /// 之后发布的事件都会送达该连接。
    pub async fn register(
        self: &Arc<Self>,
        session_id: &str,
        tx: mpsc::Sender<WsEnvelope>,
    ) -> String {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let mut rooms = self.rooms.write().await;

        let room = rooms.entry(session_id.to_string()).or_insert_with(|| {
            let subscription = self.bus.subscribe(session_id);
            let forwarder = tokio::spawn(forward_events(Arc::downgrade(self), subscription));
            debug!(session_id = %session_id, "Started session event forwarder");
            SessionRoom {
                connections: HashMap::new(),
                forwarder,
            }
        });

        room.connections.insert(
            connection_id.clone(),
            Connection {
                tx,
                connected_at: Utc::now(),
            },
        );

        info!(
            session_id = %session_id,
            connection_id = %connection_id,
            connections = room.connections.len(),
            "WebSocket connection registered"
        );

        connection_id
    }

    /// 移除连接
    ///
    /// 最后一个连接离开时停止转发任务并移除房间
    pub async fn unregister(&self, session_id: &str, connection_id: &str) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(session_id) else {
            return;
        };

        let Some(conn) = room.connections.remove(connection_id) else {
            return;
        };
        info!(
            session_id = %session_id,
            connection_id = %connection_id,
            connected_secs = (Utc::now() - conn.connected_at).num_seconds(),
            connections = room.connections.len(),
            "WebSocket connection unregistered"
        );

        if room.connections.is_empty() {
            if let Some(room) = rooms.remove(session_id) {
                room.forwarder.abort();
                debug!(session_id = %session_id, "Stopped session event forwarder");
            }
        }
    }

    /// 广播消息给会话的所有连接，返回投递成功的数量
    ///
    /// 出站队列已满的连接丢弃本条消息，已关闭的连接被移除
    pub async fn broadcast(&self, session_id: &str, envelope: &WsEnvelope) -> usize {
        let mut closed = Vec::new();
        let mut delivered = 0;

        {
            let rooms = self.rooms.read().await;
            let Some(room) = rooms.get(session_id) else {
                return 0;
            };

            for (id, conn) in &room.connections {
                match conn.tx.try_send(envelope.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(session_id = %session_id, connection_id = %id, "WebSocket outbound queue full, message dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id.clone()),
                }
            }
        }

        for id in closed {
            self.unregister(session_id, &id).await;
        }

        delivered
    }

    /// 会话的连接数量
    pub async fn connection_count(&self, session_id: &str) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(session_id).map_or(0, |room| room.connections.len())
    }

    /// 有连接的会话数量
    pub async fn session_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

/// 转发任务：订阅总线，把事件转换成信封后广播
async fn forward_events(registry: Weak<ConnectionRegistry>, mut subscription: Subscription) {
    let session_id = subscription.session_id().to_string();

    while let Some(event) = subscription.recv().await {
        let envelope = match WsEnvelope::from_event(&session_id, &event) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to encode event, dropped");
                continue;
            }
        };

        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.broadcast(&session_id, &envelope).await;
    }

    subscription.unsubscribe();
}
