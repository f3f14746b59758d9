//! 运行时状态模块
//!
//! 管理应用状态、记录存储、白名单、任务存储和日志通道

pub mod app_state;
pub mod app_store;
pub mod log_hub;
pub mod policy_store;
pub mod task_store;

pub use app_state::AppState;
pub use app_store::{AppStore, JsonFileStore, MemoryStore};
pub use log_hub::{LogHub, LogSubscription};
pub use policy_store::PolicyStore;
pub use task_store::TaskStore;
