//! 部署 API
//!
//! 触发部署、查询任务、日志流和取消

use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc};
use tokio::sync::broadcast;
use tracing::warn;

use crate::domain::app::RepoRef;
use crate::domain::deploy::{DeployTask, LogLine};
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequireApiKey;
use crate::services::deploy::DeployRequest;
use crate::state::task_store::TaskFilter;
use crate::state::{AppState, LogSubscription};

/// 部署请求体
#[derive(Debug, Clone, Deserialize)]
pub struct DeployBody {
    pub user_id: String,
    pub app_id: String,
    /// 仓库名（owner 为用户的源码平台用户名）
    pub repo_name: String,
}

/// 部署成功响应
#[derive(Debug, Serialize)]
pub struct DeployResponse {
    pub status: &'static str,
    pub task_id: String,
    pub app_id: String,
    pub image: String,
    pub container: String,
}

/// 任务历史查询参数
#[derive(Debug, Deserialize)]
pub struct TaskHistoryQuery {
    /// 返回数量限制，默认 20
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// 应用 ID 过滤
    pub app_id: Option<String>,
    /// 状态过滤 (queued, running, success, failed)
    pub status: Option<String>,
}

fn default_limit() -> usize {
    20
}

/// 任务历史响应
#[derive(Debug, Serialize)]
pub struct TaskHistoryResponse {
    pub tasks: Vec<DeployTask>,
    pub total: usize,
}

/// 取消响应
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub task_id: String,
    pub cancelled: bool,
}

/// 创建部署路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deploy", post(deploy))
        .route("/tasks/:task_id", get(get_task_status))
        .route("/tasks/recent", get(get_recent_tasks))
        .route("/tasks/:task_id/cancel", post(cancel_task))
        .route("/logs/:task_id/stream", get(stream_logs))
}

/// 部署应用
///
/// POST /deploy
/// 等待部署到达终态后返回
///
/// 部署在独立任务中执行，客户端断开不会中断进行中的尝试
async fn deploy(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DeployBody>,
) -> ApiResult<impl IntoResponse> {
    if !RepoRef::is_valid_name(&body.repo_name) {
        return Err(ApiError::bad_request(format!(
            "Invalid repository name '{}'",
            body.repo_name
        )));
    }

    if state.task_store().is_at_capacity().await {
        return Err(ApiError::conflict("Too many active deployments"));
    }

    let request = DeployRequest {
        user_id: body.user_id,
        app_id: body.app_id,
        repo_name: body.repo_name,
    };

    let deployer = state.deployer.clone();
    let outcome = tokio::spawn(async move { deployer.deploy(request).await })
        .await
        .map_err(|e| ApiError::internal(format!("Deployment task aborted: {}", e)))??;

    Ok(Json(DeployResponse {
        status: "succeeded",
        task_id: outcome.task_id,
        app_id: outcome.app_id,
        image: outcome.image,
        container: outcome.container,
    }))
}

/// 获取任务状态
///
/// GET /tasks/:task_id
///
/// 查询活跃任务和历史记录，已完成的任务也可以查到
async fn get_task_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task = state
        .task_store()
        .get(&task_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Task '{}'", task_id)))?;

    Ok(Json(task))
}

/// 获取最近的任务（进行中的排在前面）
///
/// GET /tasks/recent
async fn get_recent_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TaskHistoryQuery>,
) -> impl IntoResponse {
    let filter = TaskFilter {
        app_id: query.app_id.as_deref(),
        status: query.status.as_deref(),
    };
    let tasks = state.task_store().recent(query.limit, &filter).await;
    let total = tasks.len();

    Json(TaskHistoryResponse { tasks, total })
}

/// 取消部署
///
/// POST /tasks/:task_id/cancel
/// 需要 API Key
async fn cancel_task(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if state.deployer.cancel(&task_id).await {
        return Ok(Json(CancelResponse {
            task_id,
            cancelled: true,
        }));
    }

    match state.task_store().get(&task_id).await {
        Some(_) => Err(ApiError::conflict(format!(
            "Task '{}' has already finished",
            task_id
        ))),
        None => Err(ApiError::not_found(format!("Task '{}'", task_id))),
    }
}

/// 流式日志
///
/// GET /logs/:task_id/stream
///
/// 进行中的尝试实时推送；已结束的尝试回放保留的日志。两种情况最后都发送 `complete` 事件
async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let subscription = state
        .log_hub()
        .subscribe(&task_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Logs for task '{}'", task_id)))?;

    let stream = async_stream::stream! {
        match subscription {
            LogSubscription::Replay(lines) => {
                for line in lines {
                    yield Ok(log_event(&line));
                }
            }
            LogSubscription::Live(mut rx) => loop {
                match rx.recv().await {
                    Ok(line) => yield Ok(log_event(&line)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(task_id = %task_id, lagged = n, "Log subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            },
        }

        if let Some(task) = state.task_store().get(&task_id).await {
            yield Ok(Event::default().event("complete").data(
                serde_json::json!({
                    "status": task.status.as_str(),
                    "state": task.state,
                    "failure": task.failure,
                }).to_string()
            ));
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    ))
}

fn log_event(line: &LogLine) -> Event {
    Event::default().data(serde_json::to_string(line).unwrap_or_default())
}
