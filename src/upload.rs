//! 断点续传上传接口处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, Query};
use axum::http::{HeaderMap, header};
use axum::response::Json as JsonResponse;
use futures_util::TryStreamExt;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use tokio_util::io::StreamReader;

use crate::engine::UploadEngine;
use crate::error::ApiError;
use crate::session::Session;

pub const CHUNK_OFFSET_HEADER: &str = "x-chunk-offset";

#[derive(Deserialize)]
pub(crate) struct UploadInitRequest {
    #[serde(default)]
    filename: String,
    #[serde(default)]
    path: String,
    total_size: i64,
    chunk_size: i64,
}

#[derive(Serialize)]
pub(crate) struct UploadInitResponse {
    upload_id: String,
    uploaded_size: u64,
}

#[derive(Deserialize)]
pub(crate) struct UploadIdQuery {
    upload_id: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct UploadProgressResponse {
    uploaded_size: u64,
}

#[derive(Serialize)]
pub(crate) struct UploadCompleteResponse {
    completed: bool,
    path: String,
}

#[derive(Serialize)]
pub(crate) struct UploadCancelResponse {
    cancelled: bool,
}

/// 初始化上传会话。
pub async fn init_upload(
    Extension(engine): Extension<Arc<UploadEngine>>,
    Json(payload): Json<UploadInitRequest>,
) -> Result<JsonResponse<UploadInitResponse>, ApiError> {
    // 负数按 0 处理，由引擎统一报告参数错误
    let total_size = u64::try_from(payload.total_size).unwrap_or(0);
    let chunk_size = u64::try_from(payload.chunk_size).unwrap_or(0);
    let outcome = engine
        .init(&payload.filename, &payload.path, total_size, chunk_size)
        .await?;
    Ok(JsonResponse(UploadInitResponse {
        upload_id: outcome.id,
        uploaded_size: outcome.received_extent,
    }))
}

/// 查询会话元数据。
pub async fn upload_status(
    Query(query): Query<UploadIdQuery>,
    Extension(engine): Extension<Arc<UploadEngine>>,
) -> Result<JsonResponse<Session>, ApiError> {
    let upload_id = required_upload_id(query)?;
    Ok(JsonResponse(engine.status(&upload_id).await?))
}

/// 按 `X-Chunk-Offset` 写入单个分片，请求体长度由 `Content-Length` 给出。
pub async fn upload_chunk(
    Query(query): Query<UploadIdQuery>,
    headers: HeaderMap,
    Extension(engine): Extension<Arc<UploadEngine>>,
    body: AxumBody,
) -> Result<JsonResponse<UploadProgressResponse>, ApiError> {
    let upload_id = required_upload_id(query)?;
    let offset = header_u64(&headers, CHUNK_OFFSET_HEADER)
        .ok_or_else(|| ApiError::BadRequest("missing/invalid X-Chunk-Offset".into()))?;
    let length = header_u64(&headers, header::CONTENT_LENGTH.as_str())
        .filter(|length| *length > 0)
        .ok_or_else(|| ApiError::BadRequest("missing/invalid Content-Length".into()))?;

    let stream = BodyExt::into_data_stream(body).map_err(io::Error::other);
    let uploaded_size = engine
        .chunk(&upload_id, offset, length, StreamReader::new(stream))
        .await?;
    Ok(JsonResponse(UploadProgressResponse { uploaded_size }))
}

/// 完成上传，可重复调用。
pub async fn complete_upload(
    Query(query): Query<UploadIdQuery>,
    Extension(engine): Extension<Arc<UploadEngine>>,
) -> Result<JsonResponse<UploadCompleteResponse>, ApiError> {
    let upload_id = required_upload_id(query)?;
    let final_path = engine.complete(&upload_id).await?;
    Ok(JsonResponse(UploadCompleteResponse {
        completed: true,
        path: final_path.to_string_lossy().into_owned(),
    }))
}

/// 取消上传，清理元数据与临时分片；之后该 id 返回 404。
pub async fn cancel_upload(
    Query(query): Query<UploadIdQuery>,
    Extension(engine): Extension<Arc<UploadEngine>>,
) -> Result<JsonResponse<UploadCancelResponse>, ApiError> {
    let upload_id = required_upload_id(query)?;
    engine.cancel(&upload_id).await?;
    Ok(JsonResponse(UploadCancelResponse { cancelled: true }))
}

fn required_upload_id(query: UploadIdQuery) -> Result<String, ApiError> {
    query
        .upload_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing upload_id".into()))
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}
