//! 基础设施模块
//!
//! 封装外部依赖（源码托管平台、容器运行时、命令执行）

pub mod command;
pub mod docker;
pub mod source;

pub use command::CommandRunner;
pub use docker::{ContainerRuntime, DockerCli, LaunchSpec};
pub use source::{GitHubClient, SourceClient};
