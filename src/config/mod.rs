//! 配置模块
//!
//! 环境变量解析与白名单配置

pub mod env;
pub mod policy;

pub use env::{EnvConfig, RuntimeConfig, SourceConfig};
pub use policy::load_policy;
