//! 环境变量配置加载

use std::env;
use std::path::PathBuf;
use tracing::warn;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// 管理接口 API 密钥
    pub api_key: String,
    /// 服务监听端口
    pub port: u16,
    /// 数据目录（记录存储）
    pub data_dir: PathBuf,
    /// 部署工作目录根路径
    pub workspace_root: PathBuf,
    /// 白名单覆盖文件（JSON，可选）
    pub policy_file: Option<PathBuf>,
    /// 源码托管平台配置
    pub source: SourceConfig,
    /// 容器运行时配置
    pub runtime: RuntimeConfig,
    /// 最大并发部署数（跨应用）
    pub max_concurrent_deploys: usize,
}

/// 源码托管平台配置
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// REST API 地址
    pub api_url: String,
    /// git clone 使用的主机名
    pub git_host: String,
    /// git 可执行文件
    pub git_bin: String,
}

/// 容器运行时配置
///
/// 资源上限对所有容器一致
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// docker 可执行文件
    pub docker_bin: String,
    /// --cpu-shares
    pub cpu_shares: u32,
    /// --memory
    pub memory_limit: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            cpu_shares: constants::DEFAULT_CPU_SHARES,
            memory_limit: constants::DEFAULT_MEMORY_LIMIT.to_string(),
        }
    }
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let api_key = env::var("HOSTWAY_API_KEY").unwrap_or_else(|_| {
            warn!("HOSTWAY_API_KEY not set, admin endpoints use the default key");
            "change-me-in-production".to_string()
        });

        let port = parse_or("PORT", 3000);

        let data_dir = env::var("HOSTWAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));

        let workspace_root = env::var("HOSTWAY_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("deployments"));

        let policy_file = env::var("HOSTWAY_POLICY_FILE")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let source = SourceConfig {
            api_url: env::var("GITHUB_API_URL")
                .unwrap_or_else(|_| "https://api.github.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            git_host: env::var("GITHUB_HOST").unwrap_or_else(|_| "github.com".to_string()),
            git_bin: env::var("GIT_BIN").unwrap_or_else(|_| "git".to_string()),
        };

        let runtime = RuntimeConfig {
            docker_bin: env::var("DOCKER_BIN").unwrap_or_else(|_| "docker".to_string()),
            cpu_shares: parse_or("HOSTWAY_CPU_SHARES", constants::DEFAULT_CPU_SHARES),
            memory_limit: env::var("HOSTWAY_MEMORY_LIMIT")
                .unwrap_or_else(|_| constants::DEFAULT_MEMORY_LIMIT.to_string()),
        };

        let max_concurrent_deploys = parse_or(
            "HOSTWAY_MAX_CONCURRENT_DEPLOYS",
            constants::DEFAULT_MAX_CONCURRENT_DEPLOYS,
        )
        .max(1);

        Self {
            api_key,
            port,
            data_dir,
            workspace_root,
            policy_file,
            source,
            runtime,
            max_concurrent_deploys,
        }
    }

    /// 记录存储文件路径
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(constants::STORE_FILE_NAME)
    }
}

/// 解析环境变量，缺失或无法解析时使用默认值
fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            warn!(key = %key, value = %v, "Invalid value, using default");
            default
        }),
        Err(_) => default,
    }
}

/// 常量
pub mod constants {
    /// 部署超时（秒）
    pub const DEPLOY_TIMEOUT_SECS: u64 = 1800; // 30 分钟

    /// 拉取配方超时（秒）
    pub const FETCH_TIMEOUT_SECS: u64 = 30;

    /// git clone 超时（秒）
    pub const CLONE_TIMEOUT_SECS: u64 = 600;

    /// docker build 超时（秒）
    pub const BUILD_TIMEOUT_SECS: u64 = 1500;

    /// docker run 超时（秒）
    pub const LAUNCH_TIMEOUT_SECS: u64 = 120;

    /// 任务历史最大保存数量
    pub const MAX_TASK_HISTORY: usize = 100;

    /// 最大活跃任务数
    pub const MAX_ACTIVE_TASKS: usize = 50;

    /// 默认并发部署数
    pub const DEFAULT_MAX_CONCURRENT_DEPLOYS: usize = 4;

    /// 默认 CPU 份额
    pub const DEFAULT_CPU_SHARES: u32 = 512;

    /// 默认内存上限
    pub const DEFAULT_MEMORY_LIMIT: &str = "512m";

    /// 镜像与容器名前缀
    pub const NAME_PREFIX: &str = "hostway";

    /// 应用记录中保留的日志行数
    pub const LOG_EXCERPT_LINES: usize = 200;

    /// 记录存储文件名
    pub const STORE_FILE_NAME: &str = "db.json";

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
