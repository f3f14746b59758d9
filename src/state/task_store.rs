//! 任务存储
//!
//! 管理部署尝试的活跃任务和历史记录，自动清理过期任务

use chrono::{Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

use crate::config::env::constants::{MAX_ACTIVE_TASKS, MAX_TASK_HISTORY};
use crate::domain::deploy::{AttemptState, DeployStage, DeployStatus, DeployTask, FailureSummary};

/// 任务查询条件
#[derive(Clone, Copy, Debug, Default)]
pub struct TaskFilter<'a> {
    pub app_id: Option<&'a str>,
    /// queued, running, success, failed
    pub status: Option<&'a str>,
}

impl TaskFilter<'_> {
    fn matches(&self, task: &DeployTask) -> bool {
        self.app_id.map_or(true, |a| task.app_id == a)
            && self.status.map_or(true, |s| task.status.as_str() == s)
    }
}

/// 任务存储
///
/// 管理活跃任务和历史记录，提供清理策略
pub struct TaskStore {
    /// 活跃任务
    tasks: RwLock<HashMap<String, DeployTask>>,
    /// 历史记录
    history: RwLock<VecDeque<DeployTask>>,
    /// 最大活跃任务数
    max_active: usize,
    /// 最大历史记录数
    max_history: usize,
    /// 任务保留时间
    retention: Duration,
}

impl TaskStore {
    /// 创建新的任务存储
    pub fn new() -> Self {
        Self::with_config(MAX_ACTIVE_TASKS, MAX_TASK_HISTORY, 24)
    }

    /// 使用自定义配置创建
    pub fn with_config(max_active: usize, max_history: usize, retention_hours: i64) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            max_active,
            max_history,
            retention: Duration::hours(retention_hours),
        }
    }

    /// 创建新任务
    pub async fn create(&self, task: DeployTask) -> String {
        let task_id = task.id.clone();
        let mut tasks = self.tasks.write().await;
        tasks.insert(task_id.clone(), task);
        task_id
    }

    /// 按 ID 查找任务（活跃任务优先，然后查历史记录）
    pub async fn get(&self, task_id: &str) -> Option<DeployTask> {
        if let Some(task) = self.tasks.read().await.get(task_id) {
            return Some(task.clone());
        }
        let history = self.history.read().await;
        history.iter().find(|t| t.id == task_id).cloned()
    }

    /// 更新任务状态
    pub async fn update_status(&self, task_id: &str, status: DeployStatus) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            task.status = status;
        }
    }

    /// 推进流水线状态，并同步阶段详情
    pub async fn update_progress(
        &self,
        task_id: &str,
        state: AttemptState,
        stages: Vec<DeployStage>,
    ) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            task.state = state;
            task.stages = stages;
        }
    }

    /// 记录镜像与容器名
    pub async fn set_artifacts(&self, task_id: &str, image: &str, container: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            task.image = Some(image.to_string());
            task.container = Some(container.to_string());
        }
    }

    /// 完成任务并移到历史记录
    pub async fn finish(
        &self,
        task_id: &str,
        status: DeployStatus,
        stages: Vec<DeployStage>,
        failure: Option<FailureSummary>,
    ) {
        let task = {
            let mut tasks = self.tasks.write().await;
            tasks.remove(task_id).map(|mut task| {
                task.stages = stages;
                task.complete(status, failure);
                task
            })
        };

        if let Some(task) = task {
            self.archive(task).await;
        }
    }

    async fn archive(&self, task: DeployTask) {
        let mut history = self.history.write().await;
        history.push_front(task);

        // 限制历史记录大小
        while history.len() > self.max_history {
            history.pop_back();
        }
    }

    /// 最近的任务：进行中的在前（按开始时间倒序），然后是历史记录
    pub async fn recent(&self, limit: usize, filter: &TaskFilter<'_>) -> Vec<DeployTask> {
        let mut active: Vec<DeployTask> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        active.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let history = self.history.read().await;
        active
            .into_iter()
            .chain(history.iter().filter(|task| filter.matches(task)).cloned())
            .take(limit)
            .collect()
    }

    /// 获取历史记录总数
    pub async fn history_count(&self) -> usize {
        let history = self.history.read().await;
        history.len()
    }

    /// 清理过期任务
    ///
    /// 移除超过保留时间的已完成任务
    pub async fn cleanup_stale(&self) {
        let cutoff = Utc::now() - self.retention;

        {
            let mut tasks = self.tasks.write().await;
            tasks.retain(|_, task| {
                !task.status.is_terminal() || task.finished_at.map_or(true, |t| t > cutoff)
            });
        }

        {
            let mut history = self.history.write().await;
            history.retain(|task| task.finished_at.map_or(true, |t| t > cutoff));
        }
    }

    /// 获取活跃任务数量
    pub async fn active_count(&self) -> usize {
        let tasks = self.tasks.read().await;
        tasks.len()
    }

    /// 检查是否达到活跃任务上限
    pub async fn is_at_capacity(&self) -> bool {
        self.active_count().await >= self.max_active
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}
