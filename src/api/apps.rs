//! 用户与应用 API

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::domain::app::{Application, RepoRef};
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequireApiKey;
use crate::state::AppState;

/// 用户注册请求
///
/// 凭证来自外部 OAuth 流程，这里只负责保存
#[derive(Debug, Deserialize)]
pub struct RegisterUserRequest {
    pub source_login: String,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterUserResponse {
    pub user_id: String,
    pub source_login: String,
}

/// 应用注册请求
#[derive(Debug, Deserialize)]
pub struct RegisterAppRequest {
    pub user_id: String,
    pub app_name: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterAppResponse {
    pub app_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ListAppsQuery {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct ListAppsResponse {
    pub apps: Vec<Application>,
    pub total: usize,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/users", post(register_user))
        .route("/apps", post(register_app).get(list_apps))
        .route("/apps/:id", get(get_app))
}

/// 注册或更新用户凭证
///
/// POST /users
/// 需要 API Key：由 OAuth 回调服务调用，同一 login 会覆盖已保存的令牌
async fn register_user(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterUserRequest>,
) -> ApiResult<impl IntoResponse> {
    let login = request.source_login.trim();
    if login.is_empty() || request.token.is_empty() {
        return Err(ApiError::bad_request("source_login and token are required"));
    }
    if !RepoRef::is_valid_owner(login) {
        return Err(ApiError::bad_request(format!(
            "Invalid source login '{}'",
            login
        )));
    }

    let user = state.store.upsert_user(login, &request.token).await?;
    info!(user_id = %user.id, login = %user.source_login, "User registered");

    Ok(Json(RegisterUserResponse {
        user_id: user.id,
        source_login: user.source_login,
    }))
}

/// 注册应用
///
/// POST /apps
async fn register_app(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterAppRequest>,
) -> ApiResult<impl IntoResponse> {
    let name = request.app_name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("app_name is required"));
    }

    state
        .store
        .get_user(&request.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("User '{}'", request.user_id)))?;

    let app = Application::new(&request.user_id, name);
    let app_id = app.id.clone();
    state.store.insert_app(app).await?;

    info!(app_id = %app_id, user_id = %request.user_id, name = %name, "Application registered");
    Ok((StatusCode::CREATED, Json(RegisterAppResponse { app_id })))
}

/// 列出用户的应用
///
/// GET /apps?user_id=
async fn list_apps(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListAppsQuery>,
) -> ApiResult<impl IntoResponse> {
    let apps = state.store.list_apps_by_owner(&query.user_id).await?;
    let total = apps.len();
    Ok(Json(ListAppsResponse { apps, total }))
}

/// 获取应用记录
///
/// GET /apps/:id
async fn get_app(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let app = state
        .store
        .get_app(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Application '{}'", id)))?;
    Ok(Json(app))
}
