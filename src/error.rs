//! 统一的 API 错误类型与转换。

use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{debug, error};

use crate::config::AUTH_REALM;
use crate::storage::{PathError, StorageError};
use crate::upload::ValidationError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    PayloadTooLarge(String),
    /// 详细信息只写入服务端日志。
    Internal(String),
    Unauthorized,
    Forbidden,
    TooManyRequests(u64),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut headers = HeaderMap::new();
        let message = match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::PayloadTooLarge(msg) => msg,
            ApiError::Internal(detail) => {
                error!(detail = %detail, "internal error");
                "Internal server error".to_string()
            }
            ApiError::Unauthorized => {
                if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{AUTH_REALM}\"")) {
                    headers.insert(header::WWW_AUTHENTICATE, value);
                }
                "Unauthorized".to_string()
            }
            ApiError::Forbidden => "Forbidden".to_string(),
            ApiError::TooManyRequests(retry_after) => {
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                "Too many requests".to_string()
            }
        };
        (status, headers, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Path(err) => err.into(),
            StorageError::Io(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<PathError> for ApiError {
    fn from(error: PathError) -> Self {
        match error {
            PathError::Traversal => ApiError::BadRequest("Invalid file name".into()),
            PathError::NotFound => ApiError::NotFound("File not found".into()),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(error: ValidationError) -> Self {
        match error {
            ValidationError::TooLarge { limit } => {
                debug!(limit, "upload exceeds size ceiling");
                ApiError::PayloadTooLarge(error.to_string())
            }
            _ => ApiError::BadRequest(error.to_string()),
        }
    }
}

/// 未匹配任何路由时的 404 响应。
pub async fn not_found() -> ApiError {
    ApiError::NotFound("Not found".into())
}
