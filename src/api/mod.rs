//! API 模块
//!
//! HTTP handlers 和路由组装

pub mod apps;
pub mod deploy;
pub mod health;
pub mod policy;

use axum::Router;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// 构建完整的 API 路由
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health
        .merge(health::router())
        // Users & Apps
        .merge(apps::router())
        // Deploy
        .merge(deploy::router())
        // Policy
        .merge(policy::router())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
