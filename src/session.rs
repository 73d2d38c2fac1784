//! 上传会话元数据及其持久化存储。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use uuid::Uuid;

use crate::atomic::write_atomic;
use crate::error::{UploadError, UploadResult};

/// 一次上传尝试的持久化元数据。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "upload_id")]
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub filename: String,
    #[serde(rename = "rel_path")]
    pub target_relative_path: String,
    pub total_size: u64,
    pub chunk_size: u64,
    /// 已接收的最大字节位置，不代表 `[0, received_extent)` 连续完整。
    #[serde(rename = "uploaded_size")]
    pub received_extent: u64,
    pub completed: bool,
}

impl Session {
    pub fn new(
        filename: String,
        target_relative_path: String,
        total_size: u64,
        chunk_size: u64,
    ) -> Self {
        Self {
            id: new_session_id(),
            created_at: Utc::now(),
            filename,
            target_relative_path,
            total_size,
            chunk_size,
            received_extent: 0,
            completed: false,
        }
    }

    pub fn is_fully_received(&self) -> bool {
        self.received_extent == self.total_size
    }
}

pub fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// 会话 id 固定为 32 位小写十六进制，其他形式一律视为不存在。
pub fn is_valid_session_id(id: &str) -> bool {
    id.len() == 32
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// 状态目录下的会话元数据与临时分片文件。调用方负责持有会话锁。
#[derive(Clone, Debug)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn part_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.part"))
    }

    /// 原子写入元数据：先写同目录临时文件，再 rename 覆盖。
    pub async fn save(&self, session: &Session) -> UploadResult<()> {
        let content = serde_json::to_vec_pretty(session).map_err(std::io::Error::other)?;
        write_atomic(&self.meta_path(&session.id), &content).await?;
        Ok(())
    }

    pub async fn load(&self, id: &str) -> UploadResult<Session> {
        if !is_valid_session_id(id) {
            return Err(UploadError::NotFound);
        }
        let bytes = match fs::read(self.meta_path(id)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(UploadError::NotFound),
            Err(err) => return Err(UploadError::Io(err)),
        };
        serde_json::from_slice(&bytes).map_err(UploadError::Corrupt)
    }

    /// 删除元数据文件；文件不存在视为成功。
    pub async fn remove(&self, id: &str) -> std::io::Result<()> {
        match fs::remove_file(self.meta_path(id)).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// 列出状态目录中所有会话 id。
    pub async fn list_ids(&self) -> std::io::Result<Vec<String>> {
        let mut dir = fs::read_dir(&self.dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".json")
                && is_valid_session_id(id)
            {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
