//! 运行时状态模块
//!
//! 管理应用状态、部署名额、状态存储、事件总线与 WebSocket 连接

pub mod admission;
pub mod app_state;
pub mod event_bus;
pub mod status_store;
pub mod ws_registry;

pub use admission::{AdmissionController, AdmissionDenied, AdmissionPermit};
pub use app_state::AppState;
pub use event_bus::{EventBus, Subscription};
pub use status_store::StatusStore;
pub use ws_registry::ConnectionRegistry;
