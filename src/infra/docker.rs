//! 容器运行时
//!
//! `ContainerRuntime` 是流水线与容器运行时之间的窄接口，`DockerCli` 通过 docker CLI 实现

use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::env::constants::{BUILD_TIMEOUT_SECS, LAUNCH_TIMEOUT_SECS};
use crate::domain::deploy::{LogLine, LogStream};
use crate::domain::recipe::EnvAssignment;
use crate::error::PipelineError;
use crate::infra::command::{CommandError, CommandOutput, CommandRunner, CommandSpec};

/// 启动容器的参数
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LaunchSpec {
    pub image: String,
    pub container_name: String,
    pub cpu_shares: u32,
    pub memory_limit: String,
    pub env: Vec<EnvAssignment>,
}

impl LaunchSpec {
    /// `docker run` 参数
    pub fn docker_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.container_name.clone(),
            format!("--cpu-shares={}", self.cpu_shares),
            format!("--memory={}", self.memory_limit),
        ];
        for assignment in &self.env {
            args.push("-e".to_string());
            args.push(assignment.to_string());
        }
        args.push(self.image.clone());
        args
    }
}

/// 容器运行时协作方
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// 以 `context_dir/Dockerfile` 构建镜像并打上 `tag`
    async fn build_image(
        &self,
        context_dir: &Path,
        tag: &str,
        log_tx: Option<broadcast::Sender<LogLine>>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError>;

    /// 以分离模式启动容器，返回容器 ID
    async fn run_detached(
        &self,
        spec: &LaunchSpec,
        log_tx: Option<broadcast::Sender<LogLine>>,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError>;

    /// 强制删除同名容器（不存在时视为成功）
    async fn remove_container(&self, name: &str) -> Result<(), PipelineError>;
}

/// docker CLI 实现
#[derive(Clone, Debug)]
pub struct DockerCli {
    docker_bin: String,
}

impl DockerCli {
    pub fn new(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }
}

/// docker CLI 无法连接 daemon 时的输出特征
fn daemon_unreachable(output: &CommandOutput) -> bool {
    output.lines.iter().any(|l| {
        l.content.contains("Cannot connect to the Docker daemon")
            || l.content.contains("error during connect")
    })
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn build_image(
        &self,
        context_dir: &Path,
        tag: &str,
        log_tx: Option<broadcast::Sender<LogLine>>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let spec = CommandSpec::new(&self.docker_bin)
            .args(["build", "-t", tag])
            .arg(context_dir.to_string_lossy())
            .timeout(Duration::from_secs(BUILD_TIMEOUT_SECS));

        info!(tag = %tag, context = %context_dir.display(), "Building image");

        match CommandRunner::run(&spec, log_tx, cancel).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) if daemon_unreachable(&output) => {
                Err(PipelineError::RuntimeUnavailable(output.combined()))
            }
            Ok(output) => Err(PipelineError::BuildFailed {
                diagnostics: output.combined(),
            }),
            Err(CommandError::Cancelled) => Err(PipelineError::Cancelled),
            Err(e @ CommandError::SpawnFailed { .. }) => {
                Err(PipelineError::RuntimeUnavailable(e.to_string()))
            }
            Err(e) => Err(PipelineError::BuildFailed {
                diagnostics: e.to_string(),
            }),
        }
    }

    async fn run_detached(
        &self,
        spec: &LaunchSpec,
        log_tx: Option<broadcast::Sender<LogLine>>,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        let command = CommandSpec::new(&self.docker_bin)
            .args(spec.docker_args())
            .timeout(Duration::from_secs(LAUNCH_TIMEOUT_SECS));

        info!(
            container = %spec.container_name,
            image = %spec.image,
            cpu_shares = spec.cpu_shares,
            memory = %spec.memory_limit,
            "Starting container"
        );

        match CommandRunner::run(&command, log_tx, cancel).await {
            Ok(output) if output.success() => Ok(output
                .lines
                .iter()
                .rev()
                .find(|l| l.stream == LogStream::Stdout && !l.content.trim().is_empty())
                .map(|l| l.content.trim().to_string())
                .unwrap_or_default()),
            Ok(output) if daemon_unreachable(&output) => {
                Err(PipelineError::RuntimeUnavailable(output.combined()))
            }
            Ok(output) => Err(PipelineError::LaunchFailed {
                diagnostics: output.combined(),
            }),
            Err(CommandError::Cancelled) => Err(PipelineError::Cancelled),
            Err(e @ CommandError::SpawnFailed { .. }) => {
                Err(PipelineError::RuntimeUnavailable(e.to_string()))
            }
            Err(e) => Err(PipelineError::LaunchFailed {
                diagnostics: e.to_string(),
            }),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<(), PipelineError> {
        let spec = CommandSpec::new(&self.docker_bin)
            .args(["rm", "-f", name])
            .timeout(Duration::from_secs(LAUNCH_TIMEOUT_SECS));

        match CommandRunner::run(&spec, None, &CancellationToken::new()).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) if output.combined().contains("No such container") => Ok(()),
            Ok(output) => {
                warn!(container = %name, "docker rm failed");
                Err(PipelineError::LaunchFailed {
                    diagnostics: output.combined(),
                })
            }
            Err(e) => Err(PipelineError::RuntimeUnavailable(e.to_string())),
        }
    }
}
