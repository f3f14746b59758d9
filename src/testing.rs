//! 测试替身
//!
//! 内存实现的源码平台与容器运行时，供单元测试和 `tests/` 集成测试共用。
//! 只在 `cfg(test)` 或启用 `testing` feature 时编译，不进入发布构建

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::domain::app::{Credential, RepoRef};
use crate::domain::deploy::LogLine;
use crate::error::PipelineError;
use crate::infra::docker::{ContainerRuntime, LaunchSpec};
use crate::infra::source::SourceClient;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// 内存源码平台
#[derive(Default)]
pub struct FakeSource {
    recipes: HashMap<String, Vec<u8>>,
    clone_error: Option<String>,
    fetches: AtomicUsize,
    clones: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为 `owner/name` 仓库准备配方内容
    pub fn with_recipe(mut self, owner: &str, name: &str, recipe: &str) -> Self {
        self.recipes
            .insert(format!("{}/{}", owner, name), recipe.as_bytes().to_vec());
        self
    }

    /// 克隆时返回 `CloneFailed`
    pub fn fail_clone(mut self, output: &str) -> Self {
        self.clone_error = Some(output.to_string());
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn clone_count(&self) -> usize {
        self.clones.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceClient for FakeSource {
    async fn fetch_file(
        &self,
        repo: &RepoRef,
        path: &str,
        _credential: &Credential,
    ) -> Result<Vec<u8>, PipelineError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.recipes
            .get(&repo.to_string())
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("{} in {}", path, repo)))
    }

    async fn clone_repo(
        &self,
        repo: &RepoRef,
        _credential: &Credential,
        dest: &Path,
        log_tx: Option<broadcast::Sender<LogLine>>,
        _cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        self.clones.fetch_add(1, Ordering::SeqCst);
        if let Some(ref output) = self.clone_error {
            return Err(PipelineError::CloneFailed(output.clone()));
        }

        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| PipelineError::filesystem("create clone dir", e))?;
        tokio::fs::write(dest.join("README.md"), format!("# {}\n", repo.name))
            .await
            .map_err(|e| PipelineError::filesystem("write clone file", e))?;

        if let Some(tx) = log_tx {
            let _ = tx.send(LogLine::stderr(format!("Cloning into '{}'...", dest.display())));
        }
        Ok(())
    }
}

/// 一次镜像构建的记录
#[derive(Clone, Debug)]
pub struct BuildRecord {
    pub tag: String,
    pub context_dir: PathBuf,
    /// 构建时工作目录中的 Dockerfile 内容
    pub definition: String,
}

/// 内存容器运行时
#[derive(Default)]
pub struct FakeRuntime {
    build_error: Option<String>,
    run_error: Option<String>,
    unavailable: bool,
    build_delay: Option<Duration>,
    builds: Mutex<Vec<BuildRecord>>,
    runs: Mutex<Vec<LaunchSpec>>,
    removed: Mutex<Vec<String>>,
    active_builds: AtomicUsize,
    max_active_builds: AtomicUsize,
}

/// 构建结束（包括被取消丢弃）时递减并发计数
struct ActiveBuild<'a>(&'a AtomicUsize);

impl Drop for ActiveBuild<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_build(mut self, diagnostics: &str) -> Self {
        self.build_error = Some(diagnostics.to_string());
        self
    }

    pub fn fail_run(mut self, diagnostics: &str) -> Self {
        self.run_error = Some(diagnostics.to_string());
        self
    }

    /// 所有调用都返回 `RuntimeUnavailable`
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    pub fn builds(&self) -> Vec<BuildRecord> {
        lock(&self.builds).clone()
    }

    pub fn runs(&self) -> Vec<LaunchSpec> {
        lock(&self.runs).clone()
    }

    pub fn removed(&self) -> Vec<String> {
        lock(&self.removed).clone()
    }

    /// 观察到的最大同时构建数
    pub fn max_concurrent_builds(&self) -> usize {
        self.max_active_builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn build_image(
        &self,
        context_dir: &Path,
        tag: &str,
        log_tx: Option<broadcast::Sender<LogLine>>,
        _cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        if self.unavailable {
            return Err(PipelineError::RuntimeUnavailable(
                "Cannot connect to the Docker daemon".into(),
            ));
        }

        let active = self.active_builds.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveBuild(&self.active_builds);
        self.max_active_builds.fetch_max(active, Ordering::SeqCst);

        let definition = tokio::fs::read_to_string(context_dir.join("Dockerfile"))
            .await
            .unwrap_or_default();
        lock(&self.builds).push(BuildRecord {
            tag: tag.to_string(),
            context_dir: context_dir.to_path_buf(),
            definition,
        });

        if let Some(delay) = self.build_delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(ref diagnostics) = self.build_error {
            return Err(PipelineError::BuildFailed {
                diagnostics: diagnostics.clone(),
            });
        }

        if let Some(tx) = log_tx {
            let _ = tx.send(LogLine::stdout(format!("Successfully tagged {}:latest", tag)));
        }
        Ok(())
    }

    async fn run_detached(
        &self,
        spec: &LaunchSpec,
        _log_tx: Option<broadcast::Sender<LogLine>>,
        _cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        if self.unavailable {
            return Err(PipelineError::RuntimeUnavailable(
                "Cannot connect to the Docker daemon".into(),
            ));
        }
        if let Some(ref diagnostics) = self.run_error {
            return Err(PipelineError::LaunchFailed {
                diagnostics: diagnostics.clone(),
            });
        }

        let mut runs = lock(&self.runs);
        runs.push(spec.clone());
        Ok(format!("{:012x}", runs.len()))
    }

    async fn remove_container(&self, name: &str) -> Result<(), PipelineError> {
        lock(&self.removed).push(name.to_string());
        Ok(())
    }
}
