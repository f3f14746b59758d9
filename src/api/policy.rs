//! 运行时与白名单 API

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::middleware::RequireApiKey;
use crate::state::AppState;

/// 单个运行时的策略
#[derive(Debug, Serialize)]
pub struct RuntimePolicy {
    pub base_image: String,
    pub approved_packages: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PolicyResponse {
    pub runtimes: BTreeMap<String, RuntimePolicy>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePackagesRequest {
    pub packages: Vec<String>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/policy", get(get_policy))
        .route("/policy/:runtime", put(update_packages))
}

/// 查看运行时注册表和白名单
///
/// GET /policy
async fn get_policy(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (registry, catalog) = state.policy.snapshot().await;

    let runtimes = registry
        .runtimes()
        .filter_map(|runtime| {
            registry.base_image(runtime).map(|image| {
                (
                    runtime.to_string(),
                    RuntimePolicy {
                        base_image: image.to_string(),
                        approved_packages: catalog.packages(runtime),
                    },
                )
            })
        })
        .collect();

    Json(PolicyResponse { runtimes })
}

/// 替换某个运行时的白名单
///
/// PUT /policy/:runtime
/// 需要 API Key；只影响之后开始校验的部署
async fn update_packages(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(runtime): Path<String>,
    Json(request): Json<UpdatePackagesRequest>,
) -> ApiResult<impl IntoResponse> {
    let packages: Vec<String> = request
        .packages
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();

    if !state.policy.set_packages(&runtime, packages).await {
        return Err(ApiError::not_found(format!("Runtime '{}'", runtime)));
    }

    let (_, catalog) = state.policy.snapshot().await;
    Ok(Json(serde_json::json!({
        "runtime": runtime,
        "approved_packages": catalog.packages(&runtime),
    })))
}
