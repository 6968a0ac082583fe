use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

/// 引擎对外暴露的错误类型
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// 某个配额档位超限，`retry_after` 为该档位的重置时间
    #[error("rate limit exceeded: {limit_type} (limit {limit}), retry after {retry_after}")]
    LimitExceeded {
        limit_type: String,
        limit: u64,
        retry_after: DateTime<Utc>,
    },
    /// 调用方或来源 IP 处于封禁期
    ///
    /// `Display` 不包含原因，避免向终端用户泄露检测规则；原因仅供运维使用。
    #[error("access temporarily restricted")]
    Blocked {
        reason: String,
        retry_after: DateTime<Utc>,
    },
    #[error("counter store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl EngineError {
    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        match self {
            EngineError::LimitExceeded { retry_after, .. }
            | EngineError::Blocked { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn limit_type(&self) -> Option<&str> {
        match self {
            EngineError::LimitExceeded { limit_type, .. } => Some(limit_type),
            _ => None,
        }
    }

    /// 可在 `retry_after` 之后重试
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::LimitExceeded { .. } | EngineError::Blocked { .. }
        )
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, EngineError>;

/// 错误代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// 配置错误
    Configuration = 2003,
    /// 限流错误
    RateLimit = 3000,
    /// 封禁
    Blocked = 3003,
    /// 服务不可用
    ServiceUnavailable = 5000,
}

impl From<&EngineError> for ErrorCode {
    fn from(error: &EngineError) -> Self {
        match error {
            EngineError::LimitExceeded { .. } => ErrorCode::RateLimit,
            EngineError::Blocked { .. } => ErrorCode::Blocked,
            EngineError::StoreUnavailable(_) => ErrorCode::ServiceUnavailable,
            EngineError::InvalidConfiguration(_) => ErrorCode::Configuration,
        }
    }
}

/// 错误响应体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
}

impl ErrorResponse {
    pub fn new(error: &EngineError) -> Self {
        let message = match error {
            // 存储细节不对外
            EngineError::StoreUnavailable(_) => "service temporarily unavailable".to_string(),
            other => other.to_string(),
        };
        Self {
            code: ErrorCode::from(error) as u32,
            message,
            limit_type: error.limit_type().map(str::to_string),
            retry_after: error.retry_after(),
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status_code = match &self {
            EngineError::LimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            EngineError::Blocked { .. } => StatusCode::FORBIDDEN,
            EngineError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::InvalidConfiguration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let error_response = ErrorResponse::new(&self);
        match self.retry_after() {
            Some(at) => {
                let secs = (at - Utc::now()).num_seconds().max(1);
                (
                    status_code,
                    [(header::RETRY_AFTER, secs.to_string())],
                    Json(error_response),
                )
                    .into_response()
            }
            None => (status_code, Json(error_response)).into_response(),
        }
    }
}
