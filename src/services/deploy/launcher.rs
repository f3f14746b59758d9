//! 容器启动
//!
//! 以固定资源上限启动分离模式容器；只负责启动，不做健康检查

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::env::constants::NAME_PREFIX;
use crate::config::RuntimeConfig;
use crate::domain::deploy::LogLine;
use crate::domain::recipe::EnvAssignment;
use crate::error::PipelineError;
use crate::infra::docker::{ContainerRuntime, LaunchSpec};

/// 应用的镜像标签
pub fn image_tag(app_id: &str) -> String {
    format!("{}-{}", NAME_PREFIX, app_id)
}

/// 应用的容器名（同一应用重复部署使用同一名称）
pub fn container_name(app_id: &str) -> String {
    format!("{}-{}", NAME_PREFIX, app_id)
}

/// 组装启动参数，环境变量原样传入
pub fn launch_spec(limits: &RuntimeConfig, app_id: &str, env: &[EnvAssignment]) -> LaunchSpec {
    LaunchSpec {
        image: image_tag(app_id),
        container_name: container_name(app_id),
        cpu_shares: limits.cpu_shares,
        memory_limit: limits.memory_limit.clone(),
        env: env.to_vec(),
    }
}

/// 启动容器，返回容器 ID
///
/// 先删除上一次部署留下的同名容器，删除失败只记录警告
pub async fn launch(
    runtime: &dyn ContainerRuntime,
    spec: &LaunchSpec,
    log_tx: Option<broadcast::Sender<LogLine>>,
    cancel: &CancellationToken,
) -> Result<String, PipelineError> {
    if let Err(e) = runtime.remove_container(&spec.container_name).await {
        warn!(
            container = %spec.container_name,
            error = %e,
            "Failed to remove previous container"
        );
    }

    let container_id = runtime.run_detached(spec, log_tx, cancel).await?;
    info!(
        container = %spec.container_name,
        container_id = %container_id,
        "Container started"
    );
    Ok(container_id)
}
