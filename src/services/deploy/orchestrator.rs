//! 部署编排
//!
//! 单次部署尝试的完整流程：
//!
//! ```text
//! 排队(应用锁 + 全局并发) → Fetching → Parsing → Validating
//!     → Cloning → Building → Launching → Succeeded | Failed
//! ```
//!
//! 任一阶段失败立即结束，记录失败阶段与错误类型，清理工作目录后返回。
//! 应用状态只在容器启动成功后才会变为 `running`。

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OwnedMutexGuard, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::env::constants::{DEPLOY_TIMEOUT_SECS, LOG_EXCERPT_LINES};
use crate::config::RuntimeConfig;
use crate::domain::app::{AppStatus, Application, Credential, RepoRef};
use crate::domain::deploy::{AttemptState, DeployOutcome, DeployStatus, DeployTask, LogLine};
use crate::domain::policy::{validate, ValidatedSpec};
use crate::domain::recipe::{BuildSpecification, RECIPE_PATH};
use crate::error::{DeployFailure, PipelineError};
use crate::infra::docker::ContainerRuntime;
use crate::infra::source::SourceClient;
use crate::state::{AppStore, LogHub, PolicyStore, TaskStore};

use super::context::{summarize, DeployContext};
use super::image_builder;
use super::launcher;
use super::locks::AppLocks;
use super::workspace::{Workspace, WorkspaceManager};

/// 部署请求
#[derive(Clone, Debug)]
pub struct DeployRequest {
    pub user_id: String,
    pub app_id: String,
    pub repo_name: String,
}

/// 编排器依赖的协作方
pub struct DeployerDeps {
    pub store: Arc<dyn AppStore>,
    pub source: Arc<dyn SourceClient>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub policy: Arc<PolicyStore>,
    pub workspace_root: PathBuf,
    pub limits: RuntimeConfig,
    pub max_concurrent: usize,
}

/// 部署编排器
pub struct Deployer {
    store: Arc<dyn AppStore>,
    source: Arc<dyn SourceClient>,
    runtime: Arc<dyn ContainerRuntime>,
    policy: Arc<PolicyStore>,
    workspaces: WorkspaceManager,
    limits: RuntimeConfig,
    tasks: Arc<TaskStore>,
    logs: Arc<LogHub>,
    app_locks: AppLocks,
    permits: Arc<Semaphore>,
    /// 进行中的尝试 (task_id -> 取消令牌)
    running: RwLock<HashMap<String, CancellationToken>>,
    attempt_timeout: Duration,
}

/// 准入后持有的资源，尝试结束（包括最终状态写入）后释放
struct Admission {
    _app_guard: OwnedMutexGuard<()>,
    _permit: OwnedSemaphorePermit,
}

/// 解析出的部署目标
struct Target {
    app: Application,
    repo: RepoRef,
    credential: Credential,
}

impl Deployer {
    pub fn new(deps: DeployerDeps) -> Self {
        Self {
            store: deps.store,
            source: deps.source,
            runtime: deps.runtime,
            policy: deps.policy,
            workspaces: WorkspaceManager::new(deps.workspace_root),
            limits: deps.limits,
            tasks: Arc::new(TaskStore::new()),
            logs: Arc::new(LogHub::new()),
            app_locks: AppLocks::new(),
            permits: Arc::new(Semaphore::new(deps.max_concurrent.max(1))),
            running: RwLock::new(HashMap::new()),
            attempt_timeout: Duration::from_secs(DEPLOY_TIMEOUT_SECS),
        }
    }

    /// 覆盖单次尝试的超时时间
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    pub fn logs(&self) -> &Arc<LogHub> {
        &self.logs
    }

    /// 取消进行中（或排队中）的尝试
    pub async fn cancel(&self, task_id: &str) -> bool {
        let running = self.running.read().await;
        match running.get(task_id) {
            Some(token) => {
                info!(task_id = %task_id, "Cancelling deployment");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 进行中的尝试数量
    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    /// 执行一次部署尝试，直到终态
    pub async fn deploy(&self, request: DeployRequest) -> Result<DeployOutcome, DeployFailure> {
        let task_id = Uuid::new_v4().to_string();
        let cancel_token = CancellationToken::new();
        self.running
            .write()
            .await
            .insert(task_id.clone(), cancel_token.clone());

        self.tasks
            .create(DeployTask::new_queued(
                task_id.clone(),
                request.app_id.clone(),
                request.repo_name.clone(),
            ))
            .await;
        let log_tx = self.logs.open(&task_id).await;
        let excerpt = log_tx.subscribe();

        info!(
            task_id = %task_id,
            app_id = %request.app_id,
            repo = %request.repo_name,
            "Deployment queued"
        );

        let mut ctx = DeployContext::new(
            task_id.clone(),
            request.app_id.clone(),
            self.tasks.clone(),
            Some(log_tx),
            cancel_token.clone(),
        );

        let mut marked_building = false;
        let (result, admission) = match self.admit(&mut ctx).await {
            Ok(admission) => {
                self.tasks.update_status(&task_id, DeployStatus::Running).await;
                let timeout_task = spawn_timeout(
                    task_id.clone(),
                    self.attempt_timeout,
                    cancel_token.clone(),
                );
                let result = self.execute(&mut ctx, &request, &mut marked_building).await;
                timeout_task.abort();
                (result, Some(admission))
            }
            Err(failure) => (Err(failure), None),
        };

        let result = self
            .finish(ctx, &request, result, marked_building, excerpt)
            .await;

        drop(admission);
        self.running.write().await.remove(&task_id);
        result
    }

    /// 等待应用锁和全局并发许可，排队期间可被取消
    async fn admit(&self, ctx: &mut DeployContext) -> Result<Admission, DeployFailure> {
        let cancel = ctx.cancel_token.clone();
        let app_id = ctx.app_id.clone();

        let app_guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            guard = self.app_locks.acquire(&app_id) => Some(guard),
        };
        let Some(app_guard) = app_guard else {
            return Err(ctx.fail(AttemptState::Fetching, PipelineError::Cancelled).await);
        };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| PipelineError::Cancelled)
            }
        };

        match permit {
            Ok(permit) => Ok(Admission {
                _app_guard: app_guard,
                _permit: permit,
            }),
            Err(e) => Err(ctx.fail(AttemptState::Fetching, e).await),
        }
    }

    /// 查找应用与所有者凭证
    async fn resolve(&self, request: &DeployRequest) -> Result<Target, PipelineError> {
        let app = self
            .store
            .get_app(&request.app_id)
            .await
            .map_err(PipelineError::store)?
            .ok_or_else(|| PipelineError::NotFound(format!("application '{}'", request.app_id)))?;

        if app.owner_id != request.user_id {
            return Err(PipelineError::Unauthorized(format!(
                "application '{}' is not owned by user '{}'",
                app.id, request.user_id
            )));
        }

        let user = self
            .store
            .get_user(&request.user_id)
            .await
            .map_err(PipelineError::store)?
            .ok_or_else(|| PipelineError::NotFound(format!("user '{}'", request.user_id)))?;

        if !RepoRef::is_valid_owner(&user.source_login) {
            return Err(PipelineError::Unauthorized(format!(
                "user '{}' has an invalid source login",
                user.id
            )));
        }

        let credential = user.credential().ok_or_else(|| {
            PipelineError::Unauthorized(format!("user '{}' has no source credential", user.id))
        })?;

        Ok(Target {
            repo: RepoRef::new(&user.source_login, &request.repo_name),
            app,
            credential,
        })
    }

    /// 流水线主体
    async fn execute(
        &self,
        ctx: &mut DeployContext,
        request: &DeployRequest,
        marked_building: &mut bool,
    ) -> Result<DeployOutcome, DeployFailure> {
        let target = match self.resolve(request).await {
            Ok(target) => target,
            Err(e) => return Err(ctx.fail(AttemptState::Fetching, e).await),
        };
        let Target {
            app,
            repo,
            credential,
        } = target;

        info!(
            task_id = %ctx.task_id,
            app_id = %app.id,
            repo = %repo,
            "Deployment started"
        );

        let raw = ctx
            .run_stage(
                AttemptState::Fetching,
                self.source.fetch_file(&repo, RECIPE_PATH, &credential),
            )
            .await?;

        let spec = ctx
            .run_stage(AttemptState::Parsing, async {
                BuildSpecification::parse(&raw)
            })
            .await?;
        debug!(
            task_id = %ctx.task_id,
            runtime = %spec.runtime,
            packages = ?spec.packages,
            "Recipe parsed"
        );

        // 校验只读取快照，期间的白名单修改不影响本次尝试
        let (registry, catalog) = self.policy.snapshot().await;
        let validated = ctx
            .run_stage(AttemptState::Validating, async {
                validate(spec, &registry, &catalog)
            })
            .await?;

        ctx.begin(AttemptState::Cloning).await;
        if let Err(e) = self.store.update_status(&app.id, AppStatus::Building).await {
            return Err(ctx
                .fail(AttemptState::Cloning, PipelineError::store(e))
                .await);
        }
        *marked_building = true;

        let task_id = ctx.task_id.clone();
        let workspace = match self.workspaces.create(&app.id, &task_id).await {
            Ok(workspace) => workspace,
            Err(e) => return Err(ctx.fail(AttemptState::Cloning, e).await),
        };

        let result = self
            .build_and_launch(ctx, &app, &repo, &credential, &validated, &workspace)
            .await;

        // 清理失败只记录，不覆盖已有结果
        let _ = workspace.release().await;

        result
    }

    /// 克隆、构建、启动（均在工作目录存在期间执行）
    async fn build_and_launch(
        &self,
        ctx: &mut DeployContext,
        app: &Application,
        repo: &RepoRef,
        credential: &Credential,
        validated: &ValidatedSpec,
        workspace: &Workspace,
    ) -> Result<DeployOutcome, DeployFailure> {
        let cancel = ctx.cancel_token.clone();

        let source_dir = workspace.source_dir();
        let log_tx = ctx.log_sender();
        ctx.run_stage(
            AttemptState::Cloning,
            self.source
                .clone_repo(repo, credential, &source_dir, log_tx, &cancel),
        )
        .await?;

        let tag = launcher::image_tag(&app.id);
        let log_tx = ctx.log_sender();
        ctx.run_stage(
            AttemptState::Building,
            image_builder::build(self.runtime.as_ref(), validated, workspace, &tag, log_tx, &cancel),
        )
        .await?;

        let spec = launcher::launch_spec(&self.limits, &app.id, &validated.spec.env);
        let log_tx = ctx.log_sender();
        let container_id = ctx
            .run_stage(
                AttemptState::Launching,
                launcher::launch(self.runtime.as_ref(), &spec, log_tx, &cancel),
            )
            .await?;

        self.tasks
            .set_artifacts(&ctx.task_id, &spec.image, &spec.container_name)
            .await;
        ctx.log_stdout(&format!(
            "Container {} started ({})",
            spec.container_name, container_id
        ));
        ctx.succeed().await;

        Ok(DeployOutcome {
            task_id: ctx.task_id.clone(),
            app_id: app.id.clone(),
            image: spec.image,
            container: spec.container_name,
        })
    }

    /// 写入应用记录与任务终态
    ///
    /// 日志通道在任务进入历史记录之后才关闭，订阅者收到结束事件时可以查到终态
    async fn finish(
        &self,
        ctx: DeployContext,
        request: &DeployRequest,
        result: Result<DeployOutcome, DeployFailure>,
        marked_building: bool,
        mut excerpt: broadcast::Receiver<LogLine>,
    ) -> Result<DeployOutcome, DeployFailure> {
        match &result {
            Ok(outcome) => ctx.log_stdout(&format!(
                "=== Deployment succeeded: {} ===",
                outcome.container
            )),
            Err(failure) => ctx.log_stderr(&format!("=== {} ===", failure)),
        }

        let task_id = ctx.task_id.clone();
        let stages = ctx.into_stages();
        let tail = drain_tail(&mut excerpt, LOG_EXCERPT_LINES);
        let logs = tail
            .iter()
            .map(|line| line.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let result = match self
            .record_outcome(&request.app_id, &request.repo_name, &result, marked_building, logs)
            .await
        {
            Ok(()) => result,
            Err(e) => {
                error!(
                    task_id = %task_id,
                    app_id = %request.app_id,
                    error = %e,
                    "Failed to record deployment outcome"
                );
                match result {
                    Ok(_) => Err(DeployFailure::new(AttemptState::Launching, e)),
                    Err(failure) => Err(failure),
                }
            }
        };

        match &result {
            Ok(_) => {
                self.tasks
                    .finish(&task_id, DeployStatus::Success, stages, None)
                    .await;
            }
            Err(failure) => {
                warn!(
                    task_id = %task_id,
                    app_id = %request.app_id,
                    stage = %failure.stage,
                    kind = %failure.kind(),
                    "Deployment failed"
                );
                self.tasks
                    .finish(
                        &task_id,
                        DeployStatus::Failed,
                        stages,
                        Some(summarize(failure)),
                    )
                    .await;
            }
        }
        self.logs.close(&task_id, tail).await;

        result
    }

    /// 更新应用记录
    ///
    /// 成功时状态改为 `running` 并绑定仓库；进入克隆阶段后的失败改为 `failed`；
    /// 更早的失败只记录日志摘录。
    ///
    /// 因此已在运行的应用再次部署时若在校验阶段被拒绝，状态仍为 `running`：
    /// 旧容器未被触碰，依然在运行
    async fn record_outcome(
        &self,
        app_id: &str,
        repo_name: &str,
        result: &Result<DeployOutcome, DeployFailure>,
        marked_building: bool,
        logs: String,
    ) -> Result<(), PipelineError> {
        let Some(mut app) = self
            .store
            .get_app(app_id)
            .await
            .map_err(PipelineError::store)?
        else {
            return Ok(());
        };

        match result {
            Ok(_) => {
                app.set_status(AppStatus::Running);
                app.repo_name = Some(repo_name.to_string());
            }
            Err(_) if marked_building => app.set_status(AppStatus::Failed),
            Err(_) => {}
        }
        app.logs = logs;

        self.store.update_app(app).await.map_err(PipelineError::store)
    }
}

/// 取出缓冲中的日志行，保留最后 `limit` 行
fn drain_tail(rx: &mut broadcast::Receiver<LogLine>, limit: usize) -> Vec<LogLine> {
    let mut lines = VecDeque::with_capacity(limit);
    loop {
        match rx.try_recv() {
            Ok(line) => {
                if lines.len() == limit {
                    lines.pop_front();
                }
                lines.push_back(line);
            }
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                debug!(skipped, "Log excerpt truncated");
            }
            Err(_) => break,
        }
    }
    Vec::from(lines)
}

/// 启动超时保护任务
fn spawn_timeout(
    task_id: String,
    timeout: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        error!(
            task_id = %task_id,
            timeout_secs = timeout.as_secs(),
            "Deployment timed out"
        );
        cancel_token.cancel();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::deploy::StageStatus;
    use crate::error::ErrorKind;
    use crate::state::task_store::TaskFilter;
    use crate::state::MemoryStore;
    use crate::testing::{FakeRuntime, FakeSource};

    const PYTHON_RECIPE: &str = "language: python\n\
        commands:\n  \
          package: [requests]\n  \
          build: [pip install requests]\n  \
          start: [python migrate.py, python app.py]\n\
        env: [PORT=8080]\n";

    struct Harness {
        deployer: Arc<Deployer>,
        store: Arc<MemoryStore>,
        source: Arc<FakeSource>,
        runtime: Arc<FakeRuntime>,
        root: tempfile::TempDir,
        user_id: String,
        app_id: String,
    }

    impl Harness {
        async fn new(recipe: &str) -> Self {
            Self::with_runtime(recipe, FakeRuntime::new()).await
        }

        async fn with_runtime(recipe: &str, runtime: FakeRuntime) -> Self {
            Self::with_fakes(FakeSource::new(), recipe, runtime).await
        }

        async fn with_fakes(source: FakeSource, recipe: &str, runtime: FakeRuntime) -> Self {
            let store = Arc::new(MemoryStore::new());
            let user = store.upsert_user("octocat", "gho_token").await.unwrap();
            let app = Application::new(&user.id, "blog");
            let app_id = app.id.clone();
            store.insert_app(app).await.unwrap();

            let source = Arc::new(source.with_recipe("octocat", "blog", recipe));
            let runtime = Arc::new(runtime);
            let root = tempfile::tempdir().unwrap();

            let deployer = Arc::new(Deployer::new(DeployerDeps {
                store: store.clone(),
                source: source.clone(),
                runtime: runtime.clone(),
                policy: Arc::new(PolicyStore::builtin()),
                workspace_root: root.path().to_path_buf(),
                limits: RuntimeConfig::default(),
                max_concurrent: 4,
            }));

            Self {
                deployer,
                store,
                source,
                runtime,
                root,
                user_id: user.id,
                app_id,
            }
        }

        fn request(&self) -> DeployRequest {
            DeployRequest {
                user_id: self.user_id.clone(),
                app_id: self.app_id.clone(),
                repo_name: "blog".into(),
            }
        }

        async fn app(&self) -> Application {
            self.store.get_app(&self.app_id).await.unwrap().unwrap()
        }

        fn workspaces_left(&self) -> usize {
            std::fs::read_dir(self.root.path()).unwrap().count()
        }
    }

    #[tokio::test]
    async fn test_successful_deploy_marks_running() {
        let h = Harness::new(PYTHON_RECIPE).await;

        let outcome = h.deployer.deploy(h.request()).await.unwrap();
        assert_eq!(outcome.container, format!("hostway-{}", h.app_id));
        assert_eq!(outcome.image, format!("hostway-{}", h.app_id));

        let app = h.app().await;
        assert_eq!(app.status, AppStatus::Running);
        assert_eq!(app.repo_name.as_deref(), Some("blog"));
        assert!(app.logs.contains("Deployment succeeded"));

        let builds = h.runtime.builds();
        assert_eq!(builds.len(), 1);
        assert!(builds[0].definition.starts_with("FROM python:3.13\n"));
        assert!(builds[0]
            .definition
            .contains("CMD python migrate.py && python app.py"));

        let runs = h.runtime.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].cpu_shares, 512);
        assert_eq!(runs[0].memory_limit, "512m");
        assert_eq!(runs[0].env[0].to_string(), "PORT=8080");

        assert_eq!(h.workspaces_left(), 0);

        let task = h.deployer.tasks().get(&outcome.task_id).await.unwrap();
        assert_eq!(task.status, DeployStatus::Success);
        assert_eq!(task.state, AttemptState::Succeeded);
        assert!(task.stages.iter().all(|s| s.status == StageStatus::Success));
    }

    #[tokio::test]
    async fn test_unapproved_package_leaves_status_unchanged() {
        let recipe = PYTHON_RECIPE.replace("[requests]", "[requests, flask]");
        let h = Harness::new(&recipe).await;

        let failure = h.deployer.deploy(h.request()).await.unwrap_err();
        assert_eq!(failure.stage, AttemptState::Validating);
        assert_eq!(failure.kind(), ErrorKind::UnapprovedDependency);
        assert!(failure.to_string().contains("flask"));

        assert_eq!(h.app().await.status, AppStatus::Created);
        assert_eq!(h.source.clone_count(), 0);
        assert!(h.runtime.builds().is_empty());
        assert!(h.runtime.runs().is_empty());
        assert_eq!(h.workspaces_left(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_runtime_rejected_before_clone() {
        let recipe = PYTHON_RECIPE
            .replace("language: python", "language: rust")
            .replace("[requests]", "[]");
        let h = Harness::new(&recipe).await;

        let failure = h.deployer.deploy(h.request()).await.unwrap_err();
        assert_eq!(failure.stage, AttemptState::Validating);
        assert_eq!(failure.kind(), ErrorKind::UnsupportedRuntime);
        assert_eq!(h.source.clone_count(), 0);
        // 根目录下从未创建过工作目录
        assert_eq!(h.workspaces_left(), 0);
        assert_eq!(h.app().await.status, AppStatus::Created);
    }

    #[tokio::test]
    async fn test_build_failure_removes_workspace() {
        let runtime = FakeRuntime::new().fail_build("Step 4/5 : RUN pip install\nexit code: 1");
        let h = Harness::with_runtime(PYTHON_RECIPE, runtime).await;

        let failure = h.deployer.deploy(h.request()).await.unwrap_err();
        assert_eq!(failure.stage, AttemptState::Building);
        assert_eq!(failure.kind(), ErrorKind::BuildFailed);
        assert_eq!(
            failure.error.diagnostics(),
            Some("Step 4/5 : RUN pip install\nexit code: 1")
        );

        // 构建时工作目录存在，结束后被删除
        let builds = h.runtime.builds();
        assert_eq!(builds.len(), 1);
        assert!(!builds[0].context_dir.exists());
        assert_eq!(h.workspaces_left(), 0);

        assert!(h.runtime.runs().is_empty());
        assert_eq!(h.app().await.status, AppStatus::Failed);
    }

    #[tokio::test]
    async fn test_clone_failure_removes_workspace() {
        let source = FakeSource::new()
            .fail_clone("fatal: repository 'https://github.com/octocat/blog.git/' not found");
        let h = Harness::with_fakes(source, PYTHON_RECIPE, FakeRuntime::new()).await;

        let failure = h.deployer.deploy(h.request()).await.unwrap_err();
        assert_eq!(failure.stage, AttemptState::Cloning);
        assert_eq!(failure.kind(), ErrorKind::CloneFailed);
        assert!(failure.error.diagnostics().unwrap().contains("not found"));

        assert_eq!(h.source.clone_count(), 1);
        assert_eq!(h.workspaces_left(), 0);
        assert!(h.runtime.builds().is_empty());
        assert!(h.runtime.runs().is_empty());
        assert!(h.runtime.removed().is_empty());
        assert_eq!(h.app().await.status, AppStatus::Failed);
    }

    #[tokio::test]
    async fn test_invalid_stored_login_is_unauthorized() {
        let h = Harness::new(PYTHON_RECIPE).await;
        // 绕过 API 校验直接写入的记录
        let user = h.store.upsert_user("../orgs/acme", "tok").await.unwrap();
        let app = Application::new(&user.id, "acme");
        let app_id = app.id.clone();
        h.store.insert_app(app).await.unwrap();

        let failure = h
            .deployer
            .deploy(DeployRequest {
                user_id: user.id,
                app_id,
                repo_name: "blog".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::Unauthorized);
        assert_eq!(h.source.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_launch_failure_is_not_running() {
        let runtime = FakeRuntime::new().fail_run("port is already allocated");
        let h = Harness::with_runtime(PYTHON_RECIPE, runtime).await;

        let failure = h.deployer.deploy(h.request()).await.unwrap_err();
        assert_eq!(failure.stage, AttemptState::Launching);
        assert_eq!(failure.kind(), ErrorKind::LaunchFailed);
        assert_eq!(h.app().await.status, AppStatus::Failed);
        assert_eq!(h.workspaces_left(), 0);
    }

    #[tokio::test]
    async fn test_missing_recipe_is_not_found() {
        let h = Harness::new(PYTHON_RECIPE).await;
        let mut request = h.request();
        request.repo_name = "other".into();

        let failure = h.deployer.deploy(request).await.unwrap_err();
        assert_eq!(failure.stage, AttemptState::Fetching);
        assert_eq!(failure.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_unknown_application() {
        let h = Harness::new(PYTHON_RECIPE).await;
        let mut request = h.request();
        request.app_id = "missing".into();

        let failure = h.deployer.deploy(request).await.unwrap_err();
        assert_eq!(failure.stage, AttemptState::Fetching);
        assert_eq!(failure.kind(), ErrorKind::NotFound);
        assert_eq!(h.deployer.tasks().history_count().await, 1);
    }

    #[tokio::test]
    async fn test_foreign_application_unauthorized() {
        let h = Harness::new(PYTHON_RECIPE).await;
        let other = h.store.upsert_user("mallory", "tok").await.unwrap();
        let mut request = h.request();
        request.user_id = other.id;

        let failure = h.deployer.deploy(request).await.unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::Unauthorized);
        assert_eq!(h.source.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_build() {
        let runtime = FakeRuntime::new().with_build_delay(Duration::from_secs(30));
        let h = Harness::with_runtime(PYTHON_RECIPE, runtime).await;

        let deployer = h.deployer.clone();
        let request = h.request();
        let handle = tokio::spawn(async move { deployer.deploy(request).await });

        // 等待进入构建阶段
        let task_id = loop {
            let tasks = h
                .deployer
                .tasks()
                .recent(10, &TaskFilter { app_id: None, status: Some("running") })
                .await;
            if let Some(task) = tasks.iter().find(|t| t.state == AttemptState::Building) {
                break task.id.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert!(h.deployer.cancel(&task_id).await);

        let failure = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::Cancelled);
        assert_eq!(failure.stage, AttemptState::Building);
        assert!(h.runtime.runs().is_empty());
        assert_eq!(h.workspaces_left(), 0);
        assert_ne!(h.app().await.status, AppStatus::Running);
        assert_eq!(h.deployer.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_attempt_timeout_cancels() {
        let runtime = FakeRuntime::new().with_build_delay(Duration::from_secs(30));
        let mut h = Harness::with_runtime(PYTHON_RECIPE, runtime).await;
        let deployer = Arc::into_inner(h.deployer).unwrap();
        h.deployer = Arc::new(deployer.with_attempt_timeout(Duration::from_millis(200)));

        let failure = tokio::time::timeout(Duration::from_secs(5), h.deployer.deploy(h.request()))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::Cancelled);
        assert_eq!(h.workspaces_left(), 0);
    }

    #[tokio::test]
    async fn test_same_app_deploys_are_serialized() {
        let runtime = FakeRuntime::new().with_build_delay(Duration::from_millis(100));
        let h = Harness::with_runtime(PYTHON_RECIPE, runtime).await;

        let first = {
            let deployer = h.deployer.clone();
            let request = h.request();
            tokio::spawn(async move { deployer.deploy(request).await })
        };
        let second = {
            let deployer = h.deployer.clone();
            let request = h.request();
            tokio::spawn(async move { deployer.deploy(request).await })
        };

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
        assert_eq!(h.runtime.builds().len(), 2);
        assert_eq!(h.runtime.max_concurrent_builds(), 1);
        assert_eq!(h.app().await.status, AppStatus::Running);
    }

    #[tokio::test]
    async fn test_redeploy_removes_previous_container() {
        let h = Harness::new(PYTHON_RECIPE).await;

        h.deployer.deploy(h.request()).await.unwrap();
        h.deployer.deploy(h.request()).await.unwrap();

        let container = format!("hostway-{}", h.app_id);
        assert_eq!(h.runtime.removed(), vec![container.clone(), container]);
        assert_eq!(h.runtime.runs().len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_redeploy_keeps_running_status() {
        let h = Harness::new(PYTHON_RECIPE).await;
        h.deployer.deploy(h.request()).await.unwrap();

        let mut request = h.request();
        request.repo_name = "no-recipe".into();
        let failure = h.deployer.deploy(request).await.unwrap_err();
        assert_eq!(failure.stage, AttemptState::Fetching);

        let app = h.app().await;
        assert_eq!(app.status, AppStatus::Running);
        assert_eq!(app.repo_name.as_deref(), Some("blog"));
        assert!(app.logs.contains("no-recipe"));
        // 旧容器没有被移除
        assert_eq!(h.runtime.removed().len(), 1);
    }

    #[test]
    fn test_drain_tail_keeps_last_lines() {
        let (tx, mut rx) = broadcast::channel(16);
        for i in 0..5 {
            tx.send(LogLine::stdout(format!("line {}", i))).unwrap();
        }
        let tail: Vec<String> = drain_tail(&mut rx, 2).into_iter().map(|l| l.content).collect();
        assert_eq!(tail, vec!["line 3", "line 4"]);
        assert!(drain_tail(&mut rx, 2).is_empty());
    }

    #[tokio::test]
    async fn test_log_excerpt_recorded_on_failure() {
        let runtime = FakeRuntime::new().fail_build("compiler exploded");
        let h = Harness::with_runtime(PYTHON_RECIPE, runtime).await;

        h.deployer.deploy(h.request()).await.unwrap_err();
        let app = h.app().await;
        assert!(app.logs.contains("[5/6] Docker Build..."));
        assert!(app.logs.contains("compiler exploded"));
    }
}
