//! 命令执行器
//!
//! 提供统一的外部命令执行接口，支持：
//! - 实时日志广播
//! - 超时控制
//! - 取消支持（取消或超时时终止子进程）
//! - 完整保留 stdout/stderr 输出

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::domain::deploy::{LogLine, LogStream};

/// 命令执行错误
#[derive(Debug, Error)]
pub enum CommandError {
    /// 命令启动失败
    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// 命令超时
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
    /// 命令被取消
    #[error("Command was cancelled")]
    Cancelled,
    /// 等待命令完成失败
    #[error("Failed to wait for command: {0}")]
    WaitFailed(#[source] std::io::Error),
}

/// 待执行的命令
#[derive(Clone, Debug)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    work_dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
    timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: None,
            envs: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// 设置环境变量（不会出现在日志或进程参数中）
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// 用于日志展示的命令行（不含环境变量）
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// 命令执行结果
#[derive(Debug)]
pub struct CommandOutput {
    /// 退出状态
    pub status: ExitStatus,
    /// 按到达时间排序的输出行
    pub lines: Vec<LogLine>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// 合并后的原始输出
    pub fn combined(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// 命令执行器
pub struct CommandRunner;

impl CommandRunner {
    /// 执行命令，输出同时广播到 `log_tx`
    pub async fn run(
        spec: &CommandSpec,
        log_tx: Option<broadcast::Sender<LogLine>>,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.work_dir {
            command.current_dir(dir);
        }
        for (key, value) in &spec.envs {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| CommandError::SpawnFailed {
            program: spec.program.clone(),
            source,
        })?;

        let stdout_task = tokio::spawn(collect_lines(child.stdout.take(), LogStream::Stdout, log_tx.clone()));
        let stderr_task = tokio::spawn(collect_lines(child.stderr.take(), LogStream::Stderr, log_tx));

        // 等待命令完成，支持超时和取消
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(program = %spec.program, "Command cancelled, killing process");
                let _ = child.kill().await;
                Err(CommandError::Cancelled)
            }
            _ = tokio::time::sleep(spec.timeout) => {
                error!(program = %spec.program, "Command timed out after {:?}", spec.timeout);
                let _ = child.kill().await;
                Err(CommandError::Timeout(spec.timeout))
            }
            status = child.wait() => status.map_err(CommandError::WaitFailed),
        };

        // 等待日志读取完成
        let mut lines = stdout_task.await.unwrap_or_default();
        lines.extend(stderr_task.await.unwrap_or_default());
        lines.sort_by_key(|l| l.timestamp);

        result.map(|status| CommandOutput { status, lines })
    }
}

async fn collect_lines<R>(
    reader: Option<R>,
    stream: LogStream,
    log_tx: Option<broadcast::Sender<LogLine>>,
) -> Vec<LogLine>
where
    R: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    let Some(reader) = reader else {
        return collected;
    };

    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let log_line = LogLine::new(stream, line);
        if let Some(tx) = &log_tx {
            let _ = tx.send(log_line.clone());
        }
        collected.push(log_line);
    }
    collected
}
