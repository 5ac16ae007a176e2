//! 部署准入控制
//!
//! 全局唯一的部署名额：任一时刻最多只有一个会话在执行 playbook。
//! 名额只存在于内存中，进程重启后总是为空（启动时会记录日志）。

use std::sync::{Arc, Mutex, MutexGuard};

/// 准入控制器
///
/// 检查与占用在同一把锁内完成，多线程运行时下不会出现两个会话同时获得名额
pub struct AdmissionController {
    /// 当前持有名额的会话
    slot: Mutex<Option<String>>,
}

/// 已获得的部署名额
///
/// Drop 时无条件释放名额，覆盖成功、失败、异常乃至 panic 的所有退出路径
#[must_use = "dropping the permit releases the deployment slot"]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    session_id: String,
}

/// 名额已被其他会话占用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDenied {
    /// 当前持有名额的会话
    pub active_session: String,
}

impl AdmissionController {
    /// 创建空名额的控制器
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<String>> {
        // 临界区内不会 panic，中毒的锁仍然可以安全使用
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 尝试获得部署名额
    ///
    /// 被拒绝时不会修改已持有的名额
    pub fn try_acquire(
        self: &Arc<Self>,
        session_id: &str,
    ) -> Result<AdmissionPermit, AdmissionDenied> {
        let mut slot = self.lock();
        if let Some(active) = slot.as_ref() {
            return Err(AdmissionDenied {
                active_session: active.clone(),
            });
        }
        *slot = Some(session_id.to_string());
        drop(slot);

        tracing::info!(session_id = %session_id, "Deployment slot acquired");
        Ok(AdmissionPermit {
            controller: self.clone(),
            session_id: session_id.to_string(),
        })
    }

    /// 无条件清空名额
    pub fn release(&self) {
        let previous = self.lock().take();
        if let Some(session_id) = previous {
            tracing::info!(session_id = %session_id, "Deployment slot released");
        }
    }

    /// 当前持有名额的会话
    pub fn current(&self) -> Option<String> {
        self.lock().clone()
    }

    /// 名额是否被占用
    pub fn is_busy(&self) -> bool {
        self.lock().is_some()
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionPermit {
    /// 持有名额的会话
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release();
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("session_id", &self.session_id)
            .finish()
    }
}
