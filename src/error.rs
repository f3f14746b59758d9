//! 统一错误处理
//!
//! - `PipelineError`：部署流水线各组件的错误分类
//! - `DeployFailure`：流水线失败（阶段 + 原始错误）
//! - `ApiError`：实现 `IntoResponse`，替代重复的 `(StatusCode, Json<ErrorResponse>)` 模式

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::deploy::AttemptState;

/// 流水线错误类型（对外稳定的错误标识）
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    UpstreamUnavailable,
    MalformedRecipe,
    UnsupportedRuntime,
    UnapprovedDependency,
    CloneFailed,
    FilesystemError,
    BuildFailed,
    LaunchFailed,
    RuntimeUnavailable,
    StoreError,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::MalformedRecipe => "malformed_recipe",
            ErrorKind::UnsupportedRuntime => "unsupported_runtime",
            ErrorKind::UnapprovedDependency => "unapproved_dependency",
            ErrorKind::CloneFailed => "clone_failed",
            ErrorKind::FilesystemError => "filesystem_error",
            ErrorKind::BuildFailed => "build_failed",
            ErrorKind::LaunchFailed => "launch_failed",
            ErrorKind::RuntimeUnavailable => "runtime_unavailable",
            ErrorKind::StoreError => "store_error",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// 对应的 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::MalformedRecipe
            | ErrorKind::UnsupportedRuntime
            | ErrorKind::UnapprovedDependency => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::UpstreamUnavailable | ErrorKind::RuntimeUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::Cancelled => StatusCode::CONFLICT,
            ErrorKind::CloneFailed
            | ErrorKind::FilesystemError
            | ErrorKind::BuildFailed
            | ErrorKind::LaunchFailed
            | ErrorKind::StoreError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 流水线组件错误
///
/// 外部工具的原始输出（构建日志、运行时报错）原样保留在错误中
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("malformed recipe: {0}")]
    MalformedRecipe(String),

    #[error("unsupported runtime: {0}")]
    UnsupportedRuntime(String),

    #[error("unapproved dependency '{package}' for runtime '{runtime}'")]
    UnapprovedDependency { runtime: String, package: String },

    #[error("clone failed: {0}")]
    CloneFailed(String),

    #[error("filesystem error: {context}: {source}")]
    FilesystemError {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("image build failed: {diagnostics}")]
    BuildFailed { diagnostics: String },

    #[error("container launch failed: {diagnostics}")]
    LaunchFailed { diagnostics: String },

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// 应用记录读写失败
    #[error("record store error: {0}")]
    Store(String),

    #[error("deployment cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::NotFound(_) => ErrorKind::NotFound,
            PipelineError::Unauthorized(_) => ErrorKind::Unauthorized,
            PipelineError::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            PipelineError::MalformedRecipe(_) => ErrorKind::MalformedRecipe,
            PipelineError::UnsupportedRuntime(_) => ErrorKind::UnsupportedRuntime,
            PipelineError::UnapprovedDependency { .. } => ErrorKind::UnapprovedDependency,
            PipelineError::CloneFailed(_) => ErrorKind::CloneFailed,
            PipelineError::FilesystemError { .. } => ErrorKind::FilesystemError,
            PipelineError::BuildFailed { .. } => ErrorKind::BuildFailed,
            PipelineError::LaunchFailed { .. } => ErrorKind::LaunchFailed,
            PipelineError::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            PipelineError::Store(_) => ErrorKind::StoreError,
            PipelineError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// 创建文件系统错误
    pub fn filesystem(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::FilesystemError {
            context: context.into(),
            source,
        }
    }

    /// 记录存储错误（保留完整错误链）
    pub fn store(err: anyhow::Error) -> Self {
        Self::Store(format!("{:#}", err))
    }

    /// 外部工具原始诊断输出（如有）
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            PipelineError::BuildFailed { diagnostics }
            | PipelineError::LaunchFailed { diagnostics } => Some(diagnostics),
            PipelineError::CloneFailed(d) => Some(d),
            _ => None,
        }
    }
}

/// 流水线失败：失败阶段 + 未经转换的原始错误
#[derive(Debug, Error)]
#[error("deployment failed at {stage}: {error}")]
pub struct DeployFailure {
    pub stage: AttemptState,
    #[source]
    pub error: PipelineError,
}

impl DeployFailure {
    pub fn new(stage: AttemptState, error: PipelineError) -> Self {
        Self { stage, error }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// API 错误响应结构
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<AttemptState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            stage: None,
            kind: None,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// 统一 API 错误类型
#[derive(Debug)]
pub enum ApiError {
    /// 401 - 未授权（API Key 无效或缺失）
    Unauthorized,
    /// 404 - 资源未找到
    NotFound(String),
    /// 400 - 请求无效
    BadRequest(String),
    /// 409 - 冲突
    Conflict(String),
    /// 500 - 内部错误
    Internal(String),
    /// 部署流水线失败（状态码由错误类型决定）
    Deploy(DeployFailure),
}

impl ApiError {
    /// 创建未授权错误
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    /// 创建未找到错误
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// 创建请求无效错误
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// 创建冲突错误
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// 创建内部错误
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<DeployFailure> for ApiError {
    fn from(failure: DeployFailure) -> Self {
        Self::Deploy(failure)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{:#}", err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::new("unauthorized", "Invalid or missing API key"),
            ),
            ApiError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::new("not_found", format!("{} not found", resource)),
            ),
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, ErrorResponse::new("bad_request", msg))
            }
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, ErrorResponse::new("conflict", msg)),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("internal_error", msg),
            ),
            ApiError::Deploy(failure) => {
                let kind = failure.kind();
                let mut body = ErrorResponse::new(kind.as_str(), failure.to_string());
                body.stage = Some(failure.stage);
                body.kind = Some(kind);
                body.details = failure.error.diagnostics().map(str::to_string);
                (kind.status_code(), body)
            }
        };

        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "Unauthorized"),
            ApiError::NotFound(r) => write!(f, "Not found: {}", r),
            ApiError::BadRequest(m) => write!(f, "Bad request: {}", m),
            ApiError::Conflict(m) => write!(f, "Conflict: {}", m),
            ApiError::Internal(m) => write!(f, "Internal error: {}", m),
            ApiError::Deploy(failure) => write!(f, "{}", failure),
        }
    }
}

impl std::error::Error for ApiError {}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_with_details() {
        let resp = ErrorResponse::new("test_error", "Test message").with_details("Extra info");
        assert_eq!(resp.error, "test_error");
        assert_eq!(resp.details, Some("Extra info".to_string()));
    }

    #[test]
    fn test_kind_mapping() {
        let err = PipelineError::UnapprovedDependency {
            runtime: "python".into(),
            package: "flask".into(),
        };
        assert_eq!(err.kind(), ErrorKind::UnapprovedDependency);
        assert!(err.to_string().contains("flask"));

        let err = PipelineError::filesystem(
            "create workspace",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.kind(), ErrorKind::FilesystemError);
    }

    #[test]
    fn test_failure_keeps_raw_diagnostics() {
        let failure = DeployFailure::new(
            AttemptState::Building,
            PipelineError::BuildFailed {
                diagnostics: "step 3/5: exit code 127".into(),
            },
        );
        assert_eq!(failure.kind(), ErrorKind::BuildFailed);
        assert_eq!(failure.error.diagnostics(), Some("step 3/5: exit code 127"));
        assert!(failure.to_string().starts_with("deployment failed at building"));
    }

    #[test]
    fn test_deploy_failure_status_codes() {
        let cases = [
            (PipelineError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (PipelineError::UnsupportedRuntime("rust".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (PipelineError::RuntimeUnavailable("no docker".into()), StatusCode::SERVICE_UNAVAILABLE),
            (PipelineError::Cancelled, StatusCode::CONFLICT),
        ];
        for (err, expected) in cases {
            let resp = ApiError::from(DeployFailure::new(AttemptState::Fetching, err)).into_response();
            assert_eq!(resp.status(), expected);
        }
    }
}
