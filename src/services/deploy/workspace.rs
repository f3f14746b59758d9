//! 部署工作目录
//!
//! 每次尝试独占一个 `app_{app_id}_{attempt_id}` 目录，结束后删除且只删除一次。
//! 正常路径调用 `release`；提前返回或 panic 时由 `Drop` 兜底。

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::PipelineError;

/// 工作目录管理器
#[derive(Clone, Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 创建尝试专属的工作目录
    ///
    /// 目录已存在视为错误，保证不同尝试之间互不共享
    pub async fn create(&self, app_id: &str, attempt_id: &str) -> Result<Workspace, PipelineError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| PipelineError::filesystem(format!("create {}", self.root.display()), e))?;

        let path = self.root.join(format!("app_{}_{}", app_id, attempt_id));
        tokio::fs::create_dir(&path)
            .await
            .map_err(|e| PipelineError::filesystem(format!("create {}", path.display()), e))?;

        debug!(path = %path.display(), "Workspace created");
        Ok(Workspace {
            path,
            released: false,
        })
    }
}

/// 单次尝试的工作目录
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 源码克隆目标目录
    pub fn source_dir(&self) -> PathBuf {
        self.path.join("repo")
    }

    /// 构建定义文件路径
    pub fn build_file(&self) -> PathBuf {
        self.path.join("Dockerfile")
    }

    /// 删除工作目录
    ///
    /// 消耗自身，之后 `Drop` 不再重复删除
    pub async fn release(mut self) -> std::io::Result<()> {
        self.released = true;
        let result = tokio::fs::remove_dir_all(&self.path).await;
        match &result {
            Ok(()) => debug!(path = %self.path.display(), "Workspace released"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove workspace"),
        }
        result
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove abandoned workspace");
        }
    }
}
