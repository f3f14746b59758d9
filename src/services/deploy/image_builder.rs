//! 镜像构建
//!
//! 根据校验通过的构建规格生成 Dockerfile，写入工作目录后调用容器运行时构建

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::domain::deploy::LogLine;
use crate::domain::policy::ValidatedSpec;
use crate::domain::recipe::BuildSpecification;
use crate::error::PipelineError;
use crate::infra::docker::ContainerRuntime;

use super::workspace::Workspace;

/// 生成构建定义
///
/// - 基础镜像取自运行时注册表
/// - 源码目录 `./repo` 复制到 `/app`
/// - 每条构建命令一个 `RUN`，保持声明顺序
/// - 启动命令用 `&&` 串联为单条 `CMD`，前一条失败则不再执行后续命令
pub fn render_build_definition(base_image: &str, spec: &BuildSpecification) -> String {
    let mut lines = vec![
        format!("FROM {}", base_image),
        "WORKDIR /app".to_string(),
        "COPY ./repo .".to_string(),
    ];

    lines.extend(spec.build_commands.iter().map(|cmd| format!("RUN {}", cmd)));

    let start = spec
        .start_commands
        .iter()
        .map(|cmd| cmd.trim())
        .filter(|cmd| !cmd.is_empty())
        .collect::<Vec<_>>()
        .join(" && ");
    lines.push(format!("CMD {}", start));

    let mut definition = lines.join("\n");
    definition.push('\n');
    definition
}

/// 写入构建定义并构建镜像
pub async fn build(
    runtime: &dyn ContainerRuntime,
    validated: &ValidatedSpec,
    workspace: &Workspace,
    tag: &str,
    log_tx: Option<broadcast::Sender<LogLine>>,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let definition = render_build_definition(&validated.base_image, &validated.spec);
    let path = workspace.build_file();

    tokio::fs::write(&path, &definition)
        .await
        .map_err(|e| PipelineError::filesystem(format!("write {}", path.display()), e))?;

    info!(
        tag = %tag,
        base_image = %validated.base_image,
        build_steps = validated.spec.build_commands.len(),
        "Build definition written"
    );

    runtime.build_image(workspace.path(), tag, log_tx, cancel).await
}
