//! 部署上下文
//!
//! 单次部署尝试的执行上下文：任务信息、日志通道、取消令牌和阶段进度

use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::deploy::{
    AttemptState, DeployStage, FailureSummary, LogLine, LogStream, StageStatus,
};
use crate::error::{DeployFailure, PipelineError};
use crate::state::TaskStore;

/// 部署执行上下文
///
/// 由编排器独占，尝试结束后通过 `into_stages` 交出阶段记录
pub struct DeployContext {
    /// 任务 ID
    pub task_id: String,
    /// 应用 ID
    pub app_id: String,
    /// 取消令牌
    pub cancel_token: CancellationToken,
    tasks: Arc<TaskStore>,
    log_tx: Option<broadcast::Sender<LogLine>>,
    state: AttemptState,
    stages: Vec<DeployStage>,
}

impl DeployContext {
    pub fn new(
        task_id: String,
        app_id: String,
        tasks: Arc<TaskStore>,
        log_tx: Option<broadcast::Sender<LogLine>>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            app_id,
            cancel_token,
            tasks,
            log_tx,
            state: AttemptState::Fetching,
            stages: DeployStage::pipeline(),
        }
    }

    /// 发送日志
    pub fn log(&self, stream: LogStream, content: &str) {
        if let Some(ref tx) = self.log_tx {
            let _ = tx.send(LogLine::new(stream, content));
        }
    }

    /// 发送 stdout 日志
    pub fn log_stdout(&self, content: &str) {
        self.log(LogStream::Stdout, content);
    }

    /// 发送 stderr 日志
    pub fn log_stderr(&self, content: &str) {
        self.log(LogStream::Stderr, content);
    }

    /// 供外部命令使用的日志发送者
    pub fn log_sender(&self) -> Option<broadcast::Sender<LogLine>> {
        self.log_tx.clone()
    }

    /// 检查是否被取消
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 当前流水线状态
    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn stages(&self) -> &[DeployStage] {
        &self.stages
    }

    /// 执行一个流水线阶段
    ///
    /// 阶段开始前和执行中都会响应取消；失败时剩余阶段标记为跳过
    pub async fn run_stage<T, F>(&mut self, state: AttemptState, fut: F) -> Result<T, DeployFailure>
    where
        F: Future<Output = Result<T, PipelineError>>,
    {
        self.enter(state).await;

        let result = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => Err(PipelineError::Cancelled),
            result = fut => result,
        };

        match result {
            Ok(value) => {
                self.leave(true, None).await;
                Ok(value)
            }
            Err(error) => Err(self.fail(state, error).await),
        }
    }

    /// 提前进入阶段（随后的 `run_stage` 不会重复进入）
    pub async fn begin(&mut self, state: AttemptState) {
        self.enter(state).await;
    }

    /// 进入阶段
    async fn enter(&mut self, state: AttemptState) {
        if self.state == state
            && self
                .current_stage_mut()
                .is_some_and(|s| s.status == StageStatus::Running)
        {
            return;
        }
        self.state = state;
        if let Some(stage) = self.current_stage_mut() {
            stage.start();
        }
        let total = AttemptState::PIPELINE.len();
        let step = state.position().map_or(total, |p| p + 1);
        self.log_stdout(&format!("[{}/{}] {}...", step, total, state.display_name()));
        self.sync().await;
    }

    /// 结束当前阶段
    async fn leave(&mut self, success: bool, message: Option<String>) {
        if let Some(stage) = self.current_stage_mut() {
            stage.finish(success, message);
        }
        self.sync().await;
    }

    /// 记录阶段失败，返回对外报告的失败
    pub async fn fail(&mut self, stage: AttemptState, error: PipelineError) -> DeployFailure {
        if self.state != stage {
            self.enter(stage).await;
        }

        warn!(
            task_id = %self.task_id,
            app_id = %self.app_id,
            stage = %stage,
            kind = %error.kind(),
            error = %error,
            "Deployment stage failed"
        );
        self.log_stderr(&format!("Error: {}", error));

        if let Some(stage) = self.current_stage_mut() {
            stage.finish(false, Some(error.to_string()));
        }
        let reason = Some(format!("skipped after {} failed", stage));
        for later in self.stages.iter_mut().skip(stage.position().map_or(0, |p| p + 1)) {
            later.skip(reason.clone());
        }
        self.sync().await;

        DeployFailure::new(stage, error)
    }

    /// 全部阶段完成
    pub async fn succeed(&mut self) {
        self.state = AttemptState::Succeeded;
        info!(task_id = %self.task_id, app_id = %self.app_id, "Deployment succeeded");
        self.sync().await;
    }

    /// 交出阶段记录（释放上下文持有的日志发送者）
    pub fn into_stages(self) -> Vec<DeployStage> {
        self.stages
    }

    fn current_stage_mut(&mut self) -> Option<&mut DeployStage> {
        let name = self.state.as_str();
        self.stages.iter_mut().find(|s| s.name == name)
    }

    /// 同步进度到任务存储
    async fn sync(&self) {
        self.tasks
            .update_progress(&self.task_id, self.state, self.stages.clone())
            .await;
    }
}

/// 失败摘要
pub fn summarize(failure: &DeployFailure) -> FailureSummary {
    FailureSummary {
        stage: failure.stage,
        kind: failure.kind(),
        message: failure.error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::deploy::DeployTask;
    use crate::error::ErrorKind;

    async fn context() -> (DeployContext, Arc<TaskStore>) {
        let tasks = Arc::new(TaskStore::new());
        tasks
            .create(DeployTask::new("t1".into(), "a1".into(), "repo".into()))
            .await;
        let ctx = DeployContext::new(
            "t1".into(),
            "a1".into(),
            tasks.clone(),
            None,
            CancellationToken::new(),
        );
        (ctx, tasks)
    }

    #[tokio::test]
    async fn test_stage_success_updates_task() {
        let (mut ctx, tasks) = context().await;

        let value = ctx
            .run_stage(AttemptState::Fetching, async { Ok::<_, PipelineError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let task = tasks.get("t1").await.unwrap();
        assert_eq!(task.state, AttemptState::Fetching);
        assert_eq!(task.stages[0].status, StageStatus::Success);
        assert_eq!(task.stages[1].status, StageStatus::Pending);
    }

    #[tokio::test]
    async fn test_stage_failure_skips_rest() {
        let (mut ctx, _) = context().await;

        let failure = ctx
            .run_stage(AttemptState::Validating, async {
                Err::<(), _>(PipelineError::UnsupportedRuntime("rust".into()))
            })
            .await
            .unwrap_err();

        assert_eq!(failure.stage, AttemptState::Validating);
        assert_eq!(failure.kind(), ErrorKind::UnsupportedRuntime);

        let stages = ctx.into_stages();
        assert_eq!(stages[2].status, StageStatus::Failed);
        assert!(stages[3..].iter().all(|s| s.status == StageStatus::Skipped));
    }

    #[tokio::test]
    async fn test_begin_then_run_stage_enters_once() {
        let (mut ctx, _) = context().await;

        ctx.begin(AttemptState::Cloning).await;
        let started = ctx.stages()[3].started_at;
        ctx.run_stage(AttemptState::Cloning, async { Ok::<_, PipelineError>(()) })
            .await
            .unwrap();

        assert_eq!(ctx.stages()[3].started_at, started);
        assert_eq!(ctx.stages()[3].status, StageStatus::Success);
    }

    #[tokio::test]
    async fn test_cancelled_before_stage() {
        let (mut ctx, _) = context().await;
        ctx.cancel_token.cancel();

        let failure = ctx
            .run_stage(AttemptState::Building, async { Ok::<_, PipelineError>(()) })
            .await
            .unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::Cancelled);
        assert_eq!(failure.stage, AttemptState::Building);
    }
}
