//! 领域模型模块
//!
//! 纯数据结构与纯函数，不依赖 axum/tokio

pub mod app;
pub mod deploy;
pub mod policy;
pub mod recipe;

// Re-exports for convenience
pub use app::{AppStatus, Application, Credential, Plan, RepoRef, User};
pub use deploy::{
    AttemptState, DeployOutcome, DeployStage, DeployStatus, DeployTask, FailureSummary, LogLine,
    LogStream, StageStatus,
};
pub use policy::{PolicyCatalog, RuntimeRegistry, ValidatedSpec};
pub use recipe::{BuildSpecification, EnvAssignment, RECIPE_PATH};
