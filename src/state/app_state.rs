//! 应用状态

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 全局 shutdown token，用于优雅关闭所有后台任务
static GLOBAL_SHUTDOWN: std::sync::OnceLock<CancellationToken> = std::sync::OnceLock::new();

/// 获取全局 shutdown token
pub fn get_shutdown_token() -> CancellationToken {
    GLOBAL_SHUTDOWN
        .get_or_init(CancellationToken::new)
        .clone()
}

/// 触发全局 shutdown
pub fn trigger_shutdown() {
    if let Some(token) = GLOBAL_SHUTDOWN.get() {
        token.cancel();
    }
}

use crate::config::{load_policy, EnvConfig};
use crate::infra::docker::{ContainerRuntime, DockerCli};
use crate::infra::source::{GitHubClient, SourceClient};
use crate::services::deploy::{Deployer, DeployerDeps};

use super::app_store::{AppStore, JsonFileStore};
use super::log_hub::LogHub;
use super::policy_store::PolicyStore;
use super::task_store::TaskStore;

/// 应用状态
pub struct AppState {
    // ========== 核心配置 ==========
    /// API 密钥（用于验证管理请求）
    pub api_key: String,
    /// 环境配置
    pub config: EnvConfig,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,

    // ========== 记录与策略 ==========
    /// 用户与应用记录
    pub store: Arc<dyn AppStore>,
    /// 运行时注册表与白名单
    pub policy: Arc<PolicyStore>,

    // ========== 部署 ==========
    /// 部署编排器
    pub deployer: Arc<Deployer>,
}

impl AppState {
    /// 按配置创建生产环境状态（JSON 文件存储 + GitHub + docker CLI）
    pub async fn from_config(config: EnvConfig) -> anyhow::Result<Self> {
        let store = Arc::new(JsonFileStore::open(config.store_path()).await?);
        let source = Arc::new(GitHubClient::new(&config.source)?);
        let runtime = Arc::new(DockerCli::new(&config.runtime.docker_bin));

        let (registry, catalog) = load_policy(config.policy_file.as_deref())?;
        let policy = Arc::new(PolicyStore::new(registry, catalog));

        tracing::info!(
            port = config.port,
            data_dir = %config.data_dir.display(),
            workspace_root = %config.workspace_root.display(),
            api_url = %config.source.api_url,
            cpu_shares = config.runtime.cpu_shares,
            memory = %config.runtime.memory_limit,
            max_concurrent_deploys = config.max_concurrent_deploys,
            "Loaded configuration"
        );

        Ok(Self::with_parts(config, store, source, runtime, policy))
    }

    /// 用给定的协作方组装状态
    pub fn with_parts(
        config: EnvConfig,
        store: Arc<dyn AppStore>,
        source: Arc<dyn SourceClient>,
        runtime: Arc<dyn ContainerRuntime>,
        policy: Arc<PolicyStore>,
    ) -> Self {
        let deployer = Arc::new(Deployer::new(DeployerDeps {
            store: store.clone(),
            source,
            runtime,
            policy: policy.clone(),
            workspace_root: config.workspace_root.clone(),
            limits: config.runtime.clone(),
            max_concurrent: config.max_concurrent_deploys,
        }));

        Self {
            api_key: config.api_key.clone(),
            config,
            started_at: Utc::now(),
            store,
            policy,
            deployer,
        }
    }

    /// 任务存储
    pub fn task_store(&self) -> &Arc<TaskStore> {
        self.deployer.tasks()
    }

    /// 日志中心
    pub fn log_hub(&self) -> &Arc<LogHub> {
        self.deployer.logs()
    }
}
