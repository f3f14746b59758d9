//! Hostway - 最小化 PaaS 部署服务
//!
//! 读取仓库中的 `hostway.yml`，校验运行时与依赖白名单，
//! 生成 Dockerfile 构建镜像并以固定资源上限启动容器

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod middleware;
pub mod services;
pub mod state;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::config::EnvConfig;
use crate::state::app_state::{get_shutdown_token, trigger_shutdown};
use crate::state::AppState;

/// 命令行选项
#[derive(Clone, Debug, Default)]
pub struct CliOptions {
    /// 覆盖 PORT 环境变量
    pub port_override: Option<u16>,
}

/// 初始化日志
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hostway=info,tower_http=info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// 启动服务并阻塞直到收到退出信号
pub async fn run(options: CliOptions) -> anyhow::Result<()> {
    init_tracing();

    let mut config = EnvConfig::from_env();
    if let Some(port) = options.port_override {
        config.port = port;
    }
    let port = config.port;

    let state = Arc::new(AppState::from_config(config).await?);
    spawn_cleanup(state.clone());

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(
        port = port,
        version = config::env::constants::VERSION,
        "Hostway listening"
    );

    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            trigger_shutdown();
        }
    });

    let shutdown = get_shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("Hostway stopped");
    Ok(())
}

/// 定期清理过期任务记录和日志通道
fn spawn_cleanup(state: Arc<AppState>) {
    let shutdown = get_shutdown_token();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => cleanup_once(&state).await,
            }
        }
    });
}

async fn cleanup_once(state: &AppState) {
    state.task_store().cleanup_stale().await;
    let closed = state.log_hub().cleanup_expired(24).await;
    let active = state.task_store().active_count().await;
    let history = state.task_store().history_count().await;
    tracing::debug!(active, history, closed, "Task cleanup finished");
}
