//! 部署相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// 部署尝试的流水线状态
///
/// 只能沿 `Fetching → … → Launching → Succeeded` 前进，任一阶段失败直接进入 `Failed`
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Fetching,
    Parsing,
    Validating,
    Cloning,
    Building,
    Launching,
    Succeeded,
    Failed,
}

impl AttemptState {
    /// 按执行顺序排列的流水线阶段（不含终态）
    pub const PIPELINE: [AttemptState; 6] = [
        AttemptState::Fetching,
        AttemptState::Parsing,
        AttemptState::Validating,
        AttemptState::Cloning,
        AttemptState::Building,
        AttemptState::Launching,
    ];

    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Fetching => "fetching",
            AttemptState::Parsing => "parsing",
            AttemptState::Validating => "validating",
            AttemptState::Cloning => "cloning",
            AttemptState::Building => "building",
            AttemptState::Launching => "launching",
            AttemptState::Succeeded => "succeeded",
            AttemptState::Failed => "failed",
        }
    }

    /// 显示名称
    pub fn display_name(&self) -> &'static str {
        match self {
            AttemptState::Fetching => "Fetch Recipe",
            AttemptState::Parsing => "Parse Recipe",
            AttemptState::Validating => "Validate Policy",
            AttemptState::Cloning => "Clone Source",
            AttemptState::Building => "Docker Build",
            AttemptState::Launching => "Docker Run",
            AttemptState::Succeeded => "Succeeded",
            AttemptState::Failed => "Failed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Succeeded | AttemptState::Failed)
    }

    /// 在流水线中的位置（终态返回 None）
    pub fn position(&self) -> Option<usize> {
        Self::PIPELINE.iter().position(|s| s == self)
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 部署任务状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    /// 等待同一应用的上一次部署结束
    Queued,
    Running,
    Success,
    Failed,
}

impl DeployStatus {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStatus::Queued => "queued",
            DeployStatus::Running => "running",
            DeployStatus::Success => "success",
            DeployStatus::Failed => "failed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeployStatus::Success | DeployStatus::Failed)
    }
}

/// 阶段状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// 部署阶段信息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployStage {
    /// 阶段标识 (e.g., "fetching", "building")
    pub name: String,
    /// 显示名称 (e.g., "Fetch Recipe", "Docker Build")
    pub display_name: String,
    /// 开始时间
    pub started_at: Option<DateTime<Utc>>,
    /// 结束时间
    pub finished_at: Option<DateTime<Utc>>,
    /// 持续时间（毫秒）
    pub duration_ms: Option<i64>,
    /// 阶段状态
    pub status: StageStatus,
    /// 附加信息
    pub message: Option<String>,
}

impl DeployStage {
    /// 创建新的待执行阶段
    pub fn new(name: &str, display_name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            status: StageStatus::Pending,
            message: None,
        }
    }

    /// 为流水线状态创建阶段
    pub fn for_state(state: AttemptState) -> Self {
        Self::new(state.as_str(), state.display_name())
    }

    /// 完整的流水线阶段列表（全部 Pending）
    pub fn pipeline() -> Vec<Self> {
        AttemptState::PIPELINE
            .iter()
            .map(|s| Self::for_state(*s))
            .collect()
    }

    /// 开始执行阶段
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = StageStatus::Running;
    }

    /// 完成阶段
    pub fn finish(&mut self, success: bool, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = if success {
            StageStatus::Success
        } else {
            StageStatus::Failed
        };
        self.message = message;
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }

    /// 跳过阶段
    pub fn skip(&mut self, reason: Option<String>) {
        self.status = StageStatus::Skipped;
        self.message = reason;
    }
}

/// 失败摘要（阶段 + 错误类型 + 原始信息）
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FailureSummary {
    pub stage: AttemptState,
    pub kind: ErrorKind,
    pub message: String,
}

/// 部署任务信息
///
/// 一次部署尝试在任务存储中的可观察记录
#[derive(Clone, Debug, Serialize)]
pub struct DeployTask {
    pub id: String,
    pub app_id: String,
    pub repo_name: String,
    pub status: DeployStatus,
    /// 当前流水线状态
    pub state: AttemptState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 部署阶段详情
    #[serde(default)]
    pub stages: Vec<DeployStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureSummary>,
}

impl DeployTask {
    /// 创建新任务
    pub fn new(id: String, app_id: String, repo_name: String) -> Self {
        Self {
            id,
            app_id,
            repo_name,
            status: DeployStatus::Running,
            state: AttemptState::Fetching,
            started_at: Utc::now(),
            finished_at: None,
            stages: DeployStage::pipeline(),
            image: None,
            container: None,
            failure: None,
        }
    }

    /// 创建排队中的任务
    pub fn new_queued(id: String, app_id: String, repo_name: String) -> Self {
        Self {
            status: DeployStatus::Queued,
            ..Self::new(id, app_id, repo_name)
        }
    }

    /// 设置任务完成
    pub fn complete(&mut self, status: DeployStatus, failure: Option<FailureSummary>) {
        self.state = if status == DeployStatus::Success {
            AttemptState::Succeeded
        } else {
            AttemptState::Failed
        };
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.failure = failure;
    }
}

/// 输出流
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// 一行构建/运行输出
#[derive(Clone, Debug, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn new(stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            content: content.into(),
        }
    }

    pub fn stdout(content: impl Into<String>) -> Self {
        Self::new(LogStream::Stdout, content)
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self::new(LogStream::Stderr, content)
    }
}

/// 成功部署的结果
#[derive(Clone, Debug, Serialize)]
pub struct DeployOutcome {
    pub task_id: String,
    pub app_id: String,
    pub image: String,
    pub container: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_state_order() {
        let positions: Vec<_> = AttemptState::PIPELINE
            .iter()
            .map(|s| s.position().unwrap())
            .collect();
        assert_eq!(positions, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(AttemptState::Succeeded.position(), None);
        assert!(AttemptState::Failed.is_terminal());
        assert!(!AttemptState::Launching.is_terminal());
    }

    #[test]
    fn test_deploy_status_is_terminal() {
        assert!(!DeployStatus::Queued.is_terminal());
        assert!(!DeployStatus::Running.is_terminal());
        assert!(DeployStatus::Success.is_terminal());
        assert!(DeployStatus::Failed.is_terminal());
    }

    #[test]
    fn test_deploy_stage_lifecycle() {
        let mut stage = DeployStage::for_state(AttemptState::Building);
        assert_eq!(stage.status, StageStatus::Pending);
        assert_eq!(stage.name, "building");

        stage.start();
        assert_eq!(stage.status, StageStatus::Running);
        assert!(stage.started_at.is_some());

        stage.finish(true, Some("Done".to_string()));
        assert_eq!(stage.status, StageStatus::Success);
        assert!(stage.finished_at.is_some());
        assert!(stage.duration_ms.is_some());
    }

    #[test]
    fn test_task_complete_sets_terminal_state() {
        let mut task = DeployTask::new("t".into(), "a".into(), "repo".into());
        assert_eq!(task.stages.len(), 6);

        task.complete(
            DeployStatus::Failed,
            Some(FailureSummary {
                stage: AttemptState::Building,
                kind: ErrorKind::BuildFailed,
                message: "exit 1".into(),
            }),
        );
        assert_eq!(task.state, AttemptState::Failed);
        assert!(task.finished_at.is_some());
    }

    #[test]
    fn test_log_line_creation() {
        let line = LogLine::stderr("npm ERR! missing script: build");
        assert_eq!(line.stream, LogStream::Stderr);

        let json = serde_json::to_value(LogLine::stdout("Hello")).unwrap();
        assert_eq!(json["stream"], "stdout");
        assert_eq!(json["content"], "Hello");
    }
}
