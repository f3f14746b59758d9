//! 部署服务模块
//!
//! 配方获取 → 解析 → 校验 → 克隆 → 构建 → 启动 的完整流水线

pub mod context;
pub mod image_builder;
pub mod launcher;
pub mod locks;
pub mod orchestrator;
pub mod workspace;

pub use context::DeployContext;
pub use orchestrator::{DeployRequest, Deployer, DeployerDeps};
pub use workspace::{Workspace, WorkspaceManager};
