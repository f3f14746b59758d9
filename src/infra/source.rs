//! 源码托管平台客户端
//!
//! 拉取单个文件走 REST API（reqwest，复用连接池），克隆仓库走 git CLI

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::env::constants::{CLONE_TIMEOUT_SECS, FETCH_TIMEOUT_SECS};
use crate::config::SourceConfig;
use crate::domain::app::{Credential, RepoRef};
use crate::domain::deploy::LogLine;
use crate::error::PipelineError;
use crate::infra::command::{CommandError, CommandRunner, CommandSpec};

/// 源码托管平台协作方
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// 读取默认分支上指定路径的文件内容（已解码）
    async fn fetch_file(
        &self,
        repo: &RepoRef,
        path: &str,
        credential: &Credential,
    ) -> Result<Vec<u8>, PipelineError>;

    /// 将仓库克隆到 `dest`
    async fn clone_repo(
        &self,
        repo: &RepoRef,
        credential: &Credential,
        dest: &Path,
        log_tx: Option<broadcast::Sender<LogLine>>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError>;
}

/// GitHub contents API 响应
#[derive(Debug, Deserialize)]
struct ContentsResponse {
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
}

/// GitHub 客户端
#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    api_url: String,
    git_host: String,
    git_bin: String,
}

impl GitHubClient {
    pub fn new(config: &SourceConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("hostway/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            git_host: config.git_host.clone(),
            git_bin: config.git_bin.clone(),
        })
    }

    /// 仓库的 https 克隆地址（不含凭证）
    pub fn clone_url(&self, repo: &RepoRef) -> String {
        format!("https://{}/{}/{}.git", self.git_host, repo.owner, repo.name)
    }

    /// git 使用的 HTTP 认证头
    fn auth_header(credential: &Credential) -> String {
        let basic = STANDARD.encode(format!("x-access-token:{}", credential.token()));
        format!("Authorization: Basic {}", basic)
    }
}

#[async_trait]
impl SourceClient for GitHubClient {
    async fn fetch_file(
        &self,
        repo: &RepoRef,
        path: &str,
        credential: &Credential,
    ) -> Result<Vec<u8>, PipelineError> {
        let url = format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_url, repo.owner, repo.name, path
        );
        debug!(repo = %repo, path = %path, "Fetching file from source host");

        let resp = self
            .client
            .get(&url)
            .header("Authorization", format!("token {}", credential.token()))
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| PipelineError::UpstreamUnavailable(e.to_string()))?;

        match resp.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(PipelineError::NotFound(format!("{} in {}", path, repo)));
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(PipelineError::Unauthorized(format!(
                    "source host rejected credential for {} ({})",
                    repo,
                    resp.status()
                )));
            }
            status => {
                let body = resp.text().await.unwrap_or_default();
                warn!(repo = %repo, status = %status, "Source host returned unexpected status");
                return Err(PipelineError::UpstreamUnavailable(format!(
                    "source host returned {}: {}",
                    status, body
                )));
            }
        }

        let contents: ContentsResponse = resp
            .json()
            .await
            .map_err(|e| PipelineError::UpstreamUnavailable(format!("invalid contents response: {}", e)))?;

        if contents.encoding != "base64" {
            return Err(PipelineError::UpstreamUnavailable(format!(
                "unexpected content encoding '{}'",
                contents.encoding
            )));
        }

        // GitHub 返回的 base64 每 60 字符换行
        let compact: String = contents
            .content
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        STANDARD
            .decode(compact)
            .map_err(|e| PipelineError::UpstreamUnavailable(format!("invalid base64 content: {}", e)))
    }

    async fn clone_repo(
        &self,
        repo: &RepoRef,
        credential: &Credential,
        dest: &Path,
        log_tx: Option<broadcast::Sender<LogLine>>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let spec = CommandSpec::new(&self.git_bin)
            .args(["clone", "--depth", "1"])
            .arg(self.clone_url(repo))
            .arg(dest.to_string_lossy())
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_CONFIG_COUNT", "1")
            .env("GIT_CONFIG_KEY_0", "http.extraHeader")
            .env("GIT_CONFIG_VALUE_0", Self::auth_header(credential))
            .timeout(Duration::from_secs(CLONE_TIMEOUT_SECS));

        info!(repo = %repo, dest = %dest.display(), "Cloning repository");

        match CommandRunner::run(&spec, log_tx, cancel).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(PipelineError::CloneFailed(output.combined())),
            Err(CommandError::Cancelled) => Err(PipelineError::Cancelled),
            Err(e) => Err(PipelineError::CloneFailed(e.to_string())),
        }
    }
}
