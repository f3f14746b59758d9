//! 管理接口认证
//!
//! 取消部署、修改白名单等操作需要携带 API key：
//! `x-api-key: <key>` 或 `Authorization: Bearer <key>`

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;

const API_KEY_HEADER: &str = "x-api-key";

/// 管理接口 extractor，key 不匹配时返回 401
#[derive(Debug, Clone)]
pub struct RequireApiKey;

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireApiKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(provided) = provided_key(&parts.headers) else {
            tracing::warn!(path = %parts.uri.path(), "Admin request without API key");
            return Err(ApiError::unauthorized());
        };

        if !keys_match(provided, &state.api_key) {
            tracing::warn!(path = %parts.uri.path(), "Admin request with invalid API key");
            return Err(ApiError::unauthorized());
        }

        Ok(RequireApiKey)
    }
}

fn provided_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(key);
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// 逐字节比较，耗时不依赖第一个不同字节的位置
fn keys_match(provided: &str, expected: &str) -> bool {
    let (a, b) = (provided.as_bytes(), expected.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_header_forms() {
        let mut headers = HeaderMap::new();
        assert_eq!(provided_key(&headers), None);

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer admin-key"),
        );
        assert_eq!(provided_key(&headers), Some("admin-key"));

        // x-api-key 优先
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("other"));
        assert_eq!(provided_key(&headers), Some("other"));
    }

    #[test]
    fn test_basic_auth_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Basic YWRtaW46a2V5"),
        );
        assert_eq!(provided_key(&headers), None);
    }

    #[test]
    fn test_keys_match() {
        assert!(keys_match("test-key", "test-key"));
        assert!(!keys_match("test-kex", "test-key"));
        assert!(!keys_match("test", "test-key"));
        assert!(!keys_match("", "test-key"));
    }
}
