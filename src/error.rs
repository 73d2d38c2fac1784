//! 上传核心错误分类与 HTTP 错误映射。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::io;
use thiserror::Error;
use tracing::error;

/// 上传引擎及其组件返回的错误。
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid path")]
    InvalidPath,

    #[error("upload not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("file too large")]
    TooLarge,

    #[error("short write: expected {expected} bytes, wrote {written}")]
    ShortWrite { expected: u64, written: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("directory scan failed: {0}")]
    ScanFailed(io::Error),

    #[error("session metadata is corrupt: {0}")]
    Corrupt(serde_json::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
    Conflict(String),
    PayloadTooLarge(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg).into_response(),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::InvalidArgument(msg) => ApiError::BadRequest(msg),
            UploadError::InvalidPath => ApiError::BadRequest("invalid path".into()),
            UploadError::NotFound => ApiError::NotFound("not found".into()),
            UploadError::Conflict(msg) => ApiError::Conflict(msg),
            UploadError::TooLarge => ApiError::PayloadTooLarge("file too large".into()),
            UploadError::ShortWrite { expected, written } => {
                error!(expected, written, "short write");
                ApiError::Internal("short write".into())
            }
            UploadError::Io(err) => {
                error!(error = %err, "storage failure");
                ApiError::Internal("storage failure".into())
            }
            UploadError::ScanFailed(err) => {
                error!(error = %err, "tree scan failed");
                ApiError::Internal("scan failed".into())
            }
            UploadError::Corrupt(err) => {
                error!(error = %err, "corrupt session metadata");
                ApiError::Internal("load failed".into())
            }
        }
    }
}
