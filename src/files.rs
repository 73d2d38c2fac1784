//! 目录树与健康检查处理器。

use axum::extract::{Extension, Query};
use axum::response::Json as JsonResponse;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::engine::UploadEngine;
use crate::error::ApiError;
use crate::tree::{
    DEFAULT_TREE_MAX_DEPTH, DEFAULT_TREE_MAX_ENTRIES, DirNode, MAX_TREE_DEPTH, MAX_TREE_ENTRIES,
};

#[derive(Deserialize)]
pub(crate) struct TreeQuery {
    max_depth: Option<String>,
    max_entries: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct TreeResponse {
    root: DirNode,
}

#[derive(Serialize)]
pub(crate) struct HealthResponse {
    ok: bool,
}

/// 返回存储根目录下的目录结构（不含文件），供前端选择上传目录。
pub async fn storage_tree(
    Query(query): Query<TreeQuery>,
    Extension(engine): Extension<Arc<UploadEngine>>,
) -> Result<JsonResponse<TreeResponse>, ApiError> {
    let max_depth = parse_limit(
        query.max_depth.as_deref(),
        0,
        MAX_TREE_DEPTH,
        DEFAULT_TREE_MAX_DEPTH,
    );
    let max_entries = parse_limit(
        query.max_entries.as_deref(),
        1,
        MAX_TREE_ENTRIES,
        DEFAULT_TREE_MAX_ENTRIES,
    );
    let root = engine.tree(max_depth, max_entries).await?;
    info!(max_depth, max_entries, "storage tree");
    Ok(JsonResponse(TreeResponse { root }))
}

pub async fn health() -> JsonResponse<HealthResponse> {
    JsonResponse(HealthResponse { ok: true })
}

/// 解析查询参数；缺失、无法解析或越界时使用默认值。
fn parse_limit<T>(raw: Option<&str>, min: T, max: T, default: T) -> T
where
    T: FromStr + PartialOrd,
{
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| *value >= min && *value <= max)
        .unwrap_or(default)
}
