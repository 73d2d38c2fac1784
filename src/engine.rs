//! 断点续传会话引擎：初始化、分片写入、状态查询、完成与取消。

use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncRead;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::atomic::sync_dir;
use crate::chunk;
use crate::config::UploadConfig;
use crate::error::{UploadError, UploadResult};
use crate::locking::{SessionLocks, SessionProgress};
use crate::session::{Session, SessionStore, is_valid_session_id};
use crate::storage::{Storage, sanitize_relative_path};
use crate::tree::{DirNode, MAX_TREE_DEPTH, MAX_TREE_ENTRIES, scan_tree};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOutcome {
    pub id: String,
    pub received_extent: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapReport {
    pub cancelled: usize,
    pub released: usize,
}

/// Owns the storage root, the session store and the per-session locks.
///
/// Every mutating operation on a session runs under that session's lock;
/// `status` reads the durable record without locking.
pub struct UploadEngine {
    storage: Storage,
    store: SessionStore,
    locks: SessionLocks,
    config: UploadConfig,
}

impl UploadEngine {
    /// 创建引擎并确保存储根目录与状态目录存在。
    pub async fn new(storage: Storage, config: UploadConfig) -> io::Result<Self> {
        storage.ensure_root().await?;
        let store = SessionStore::new(storage.state_dir());
        Ok(Self {
            storage,
            store,
            locks: SessionLocks::new(),
            config,
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// 校验参数并创建会话：先写元数据，再预分配临时分片文件。
    pub async fn init(
        &self,
        filename: &str,
        path: &str,
        total_size: u64,
        chunk_size: u64,
    ) -> UploadResult<InitOutcome> {
        let filename = filename.trim();
        let path = path.trim();
        let path = if path.is_empty() { filename } else { path };
        if path.is_empty() {
            return Err(UploadError::InvalidArgument(
                "path or filename is required".into(),
            ));
        }
        if total_size == 0 {
            return Err(UploadError::InvalidArgument(
                "total_size must be > 0".into(),
            ));
        }
        if self.config.max_file_bytes > 0 && total_size > self.config.max_file_bytes {
            return Err(UploadError::TooLarge);
        }
        if chunk_size == 0 || chunk_size > self.config.max_chunk_bytes {
            return Err(UploadError::InvalidArgument("invalid chunk_size".into()));
        }

        let rel_path = sanitize_relative_path(path)?;
        if self.storage.is_state_path(&rel_path) {
            return Err(UploadError::InvalidPath);
        }
        self.storage.resolve(&rel_path)?;
        let filename = if filename.is_empty() {
            rel_path.rsplit('/').next().unwrap_or(&rel_path).to_string()
        } else {
            filename.to_string()
        };

        let session = Session::new(filename, rel_path, total_size, chunk_size);
        self.store.save(&session).await?;
        let part_path = self.store.part_path(&session.id);
        if let Err(err) = chunk::preallocate(&part_path, total_size).await {
            let _ = fs::remove_file(&part_path).await;
            let _ = self.store.remove(&session.id).await;
            return Err(err);
        }

        info!(
            upload_id = session.id,
            filename = session.filename,
            rel_path = session.target_relative_path,
            total_size,
            chunk_size,
            "init upload"
        );
        Ok(InitOutcome {
            id: session.id,
            received_extent: 0,
        })
    }

    /// 将 `length` 字节写入 `offset` 处，返回最新的已接收位置。
    pub async fn chunk<R>(&self, id: &str, offset: u64, length: u64, body: R) -> UploadResult<u64>
    where
        R: AsyncRead,
    {
        if length == 0 {
            return Err(UploadError::InvalidArgument("length must be > 0".into()));
        }
        if length > self.config.max_chunk_bytes {
            return Err(UploadError::InvalidArgument("chunk too large".into()));
        }

        let (mut progress, mut session) = self.lock_session(id).await?;
        if session.completed {
            return Err(UploadError::Conflict("already completed".into()));
        }
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= session.total_size)
            .ok_or_else(|| UploadError::InvalidArgument("chunk out of range".into()))?;

        chunk::write_at(&self.store.part_path(id), offset, body, length).await?;

        session.received_extent = session.received_extent.max(end);
        let pending = session.received_extent - progress.flushed_extent;
        if session.is_fully_received() || pending >= self.config.persist_threshold {
            self.store.save(&session).await?;
            progress.flushed_extent = session.received_extent;
        } else {
            debug!(upload_id = id, pending, "metadata flush deferred");
        }
        progress.received_extent = session.received_extent;

        debug!(
            upload_id = id,
            offset,
            length,
            received_extent = session.received_extent,
            "chunk written"
        );
        Ok(session.received_extent)
    }

    /// 返回已落盘的会话元数据。
    pub async fn status(&self, id: &str) -> UploadResult<Session> {
        self.store.load(id).await
    }

    /// 将临时分片文件原子移动到目标路径；已完成的会话直接返回目标路径。
    pub async fn complete(&self, id: &str) -> UploadResult<PathBuf> {
        let (progress, session) = self.lock_session(id).await?;
        let final_path = self.storage.resolve(&session.target_relative_path)?;
        if session.completed {
            return Ok(final_path);
        }
        if !session.is_fully_received() {
            return Err(UploadError::Conflict(format!(
                "not fully uploaded: {}/{}",
                session.received_extent, session.total_size
            )));
        }

        let part_path = self.store.part_path(id);
        if !fs::try_exists(&part_path).await? {
            return self
                .recover_finalized(id, progress, session, final_path)
                .await;
        }

        self.storage
            .ensure_no_symlink_components(&final_path, true)
            .await?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        OpenOptions::new()
            .write(true)
            .open(&part_path)
            .await?
            .sync_all()
            .await?;
        fs::rename(&part_path, &final_path).await?;
        if let Some(parent) = final_path.parent() {
            let _ = sync_dir(parent).await;
        }

        self.mark_completed(id, progress, session, final_path).await
    }

    /// 临时文件已被移走但元数据未标记完成（上次完成时保存元数据失败）。
    ///
    /// 目标文件存在且长度与声明一致时补记完成状态，否则报告错误。
    async fn recover_finalized(
        &self,
        id: &str,
        progress: OwnedMutexGuard<SessionProgress>,
        session: Session,
        final_path: PathBuf,
    ) -> UploadResult<PathBuf> {
        match fs::symlink_metadata(&final_path).await {
            Ok(meta) if meta.is_file() && meta.len() == session.total_size => {
                warn!(
                    upload_id = id,
                    path = ?final_path,
                    "upload part already moved into place, recording completion"
                );
                self.mark_completed(id, progress, session, final_path).await
            }
            _ => {
                warn!(upload_id = id, path = ?final_path, "upload part is missing");
                Err(UploadError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    "upload part is missing",
                )))
            }
        }
    }

    async fn mark_completed(
        &self,
        id: &str,
        mut progress: OwnedMutexGuard<SessionProgress>,
        mut session: Session,
        final_path: PathBuf,
    ) -> UploadResult<PathBuf> {
        session.completed = true;
        self.store.save(&session).await?;
        progress.flushed_extent = session.received_extent;

        info!(
            upload_id = id,
            path = ?final_path,
            total_size = session.total_size,
            "upload complete"
        );
        Ok(final_path)
    }

    /// 取消未完成的会话并尽力清理临时文件与元数据。
    pub async fn cancel(&self, id: &str) -> UploadResult<()> {
        let (progress, session) = self.lock_session(id).await?;
        if session.completed {
            return Err(UploadError::Conflict("already completed".into()));
        }
        self.discard(id, progress).await;
        info!(upload_id = id, "upload cancelled");
        Ok(())
    }

    /// 持锁复查闲置时间，仍超过 `ttl` 时取消会话并返回闲置时长。
    async fn cancel_if_idle(&self, id: &str, ttl: Duration) -> UploadResult<Option<Duration>> {
        let (progress, session) = self.lock_session(id).await?;
        if session.completed {
            return Ok(None);
        }
        let Some(last_activity) = self.last_activity(id).await else {
            return Ok(None);
        };
        let idle = SystemTime::now()
            .duration_since(last_activity)
            .unwrap_or_default();
        if idle < ttl {
            return Ok(None);
        }
        self.discard(id, progress).await;
        Ok(Some(idle))
    }

    /// 删除临时分片与元数据，并移除锁条目。调用方必须持有该会话的锁。
    async fn discard(&self, id: &str, progress: OwnedMutexGuard<SessionProgress>) {
        let part_path = self.store.part_path(id);
        if let Err(err) = fs::remove_file(&part_path).await
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(upload_id = id, path = ?part_path, error = %err, "failed to remove upload part");
        }
        if let Err(err) = self.store.remove(id).await {
            warn!(upload_id = id, error = %err, "failed to remove upload metadata");
        }
        self.locks.release(id).await;
        drop(progress);
    }

    /// 扫描存储根目录下的目录树（在阻塞线程池中执行）。
    pub async fn tree(&self, max_depth: u32, max_entries: u64) -> UploadResult<DirNode> {
        let root = self.storage.root_path().to_path_buf();
        let excluded = self.storage.state_dir_name().to_string();
        let max_depth = max_depth.min(MAX_TREE_DEPTH);
        let max_entries = max_entries.clamp(1, MAX_TREE_ENTRIES);
        tokio::task::spawn_blocking(move || scan_tree(&root, &excluded, max_depth, max_entries))
            .await
            .map_err(|err| UploadError::ScanFailed(io::Error::other(err.to_string())))?
    }

    /// 取消闲置超过 `ttl` 的未完成会话，并释放已完成会话的锁条目。
    pub async fn reap_stale(&self, ttl: Duration) -> io::Result<ReapReport> {
        let now = SystemTime::now();
        let mut report = ReapReport::default();
        for id in self.store.list_ids().await? {
            let session = match self.store.load(&id).await {
                Ok(session) => session,
                Err(err) => {
                    warn!(upload_id = id, error = %err, "skipping unreadable session");
                    continue;
                }
            };
            if session.completed {
                self.locks.release(&id).await;
                report.released += 1;
                continue;
            }

            let Some(last_activity) = self.last_activity(&id).await else {
                continue;
            };
            if now.duration_since(last_activity).unwrap_or_default() < ttl {
                continue;
            }
            // 未持锁的预筛选，取消前在锁内复查
            match self.cancel_if_idle(&id, ttl).await {
                Ok(Some(idle)) => {
                    info!(upload_id = id, idle_secs = idle.as_secs(), "reaped stale upload");
                    report.cancelled += 1;
                }
                Ok(None) => debug!(upload_id = id, "upload became active, not reaped"),
                Err(UploadError::NotFound) => {}
                Err(err) => warn!(upload_id = id, error = %err, "failed to reap stale upload"),
            }
        }
        Ok(report)
    }

    async fn last_activity(&self, id: &str) -> Option<SystemTime> {
        for path in [self.store.part_path(id), self.store.meta_path(id)] {
            if let Ok(modified) = fs::metadata(&path).await.and_then(|meta| meta.modified()) {
                return Some(modified);
            }
        }
        None
    }

    /// 获取会话锁并加载元数据，合并内存中尚未落盘的进度。
    async fn lock_session(
        &self,
        id: &str,
    ) -> UploadResult<(OwnedMutexGuard<SessionProgress>, Session)> {
        if !is_valid_session_id(id) {
            return Err(UploadError::NotFound);
        }
        let mut progress = self.locks.acquire(id).await;
        let mut session = match self.store.load(id).await {
            Ok(session) => session,
            Err(UploadError::NotFound) => {
                drop(progress);
                self.locks.release(id).await;
                return Err(UploadError::NotFound);
            }
            Err(err) => return Err(err),
        };
        progress.flushed_extent = progress.flushed_extent.max(session.received_extent);
        progress.received_extent = progress.received_extent.max(session.received_extent);
        session.received_extent = progress.received_extent.min(session.total_size);
        Ok((progress, session))
    }

    #[cfg(test)]
    async fn lock_count(&self) -> usize {
        self.locks.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIB;
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn make_engine(config: UploadConfig) -> (tempfile::TempDir, UploadEngine) {
        let temp = tempdir().expect("tempdir");
        let storage =
            Storage::new(temp.path().join("storage"), ".upload_state").expect("storage");
        let engine = UploadEngine::new(storage, config).await.expect("engine");
        (temp, engine)
    }

    fn small_config() -> UploadConfig {
        UploadConfig::new(MIB, 10 * MIB)
    }

    async fn send(engine: &UploadEngine, id: &str, offset: u64, data: &[u8]) -> UploadResult<u64> {
        engine.chunk(id, offset, data.len() as u64, data).await
    }

    fn state_entries(engine: &UploadEngine) -> usize {
        std::fs::read_dir(engine.storage().state_dir())
            .expect("read state dir")
            .count()
    }

    #[tokio::test]
    async fn two_chunk_upload_lands_at_target_path() {
        let (_temp, engine) = make_engine(small_config()).await;
        let init = engine.init("a.bin", "x/a.bin", 10, 5).await.expect("init");
        assert_eq!(init.received_extent, 0);

        assert_eq!(send(&engine, &init.id, 0, b"AAAAA").await.expect("chunk"), 5);
        assert_eq!(send(&engine, &init.id, 5, b"BBBBB").await.expect("chunk"), 10);

        let final_path = engine.complete(&init.id).await.expect("complete");
        assert_eq!(final_path, engine.storage().root_path().join("x").join("a.bin"));
        assert_eq!(std::fs::read(&final_path).expect("read"), b"AAAAABBBBB");

        let session = engine.status(&init.id).await.expect("status");
        assert!(session.completed);
        assert_eq!(session.received_extent, 10);
        assert!(!engine.store.part_path(&init.id).exists());
    }

    #[tokio::test]
    async fn init_validates_before_any_mutation() {
        let (_temp, engine) = make_engine(small_config()).await;

        assert!(matches!(
            engine.init("a.bin", "a.bin", 0, 5).await,
            Err(UploadError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.init("a.bin", "a.bin", 11 * MIB, 5).await,
            Err(UploadError::TooLarge)
        ));
        assert!(matches!(
            engine.init("a.bin", "a.bin", 10, 0).await,
            Err(UploadError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.init("a.bin", "a.bin", 10, MIB + 1).await,
            Err(UploadError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.init("passwd", "../../etc/passwd", 10, 5).await,
            Err(UploadError::InvalidPath)
        ));
        assert!(matches!(
            engine.init("x", ".upload_state/x.part", 10, 5).await,
            Err(UploadError::InvalidPath)
        ));
        assert!(matches!(
            engine.init("  ", "", 10, 5).await,
            Err(UploadError::InvalidArgument(_))
        ));

        assert_eq!(state_entries(&engine), 0);
    }

    #[tokio::test]
    async fn init_preallocates_and_defaults_names() {
        let (_temp, engine) = make_engine(small_config()).await;

        let by_path = engine.init("", "docs/report.pdf", 4096, 1024).await.expect("init");
        let session = engine.status(&by_path.id).await.expect("status");
        assert_eq!(session.filename, "report.pdf");
        assert_eq!(session.target_relative_path, "docs/report.pdf");
        assert_eq!(session.received_extent, 0);
        assert!(!session.completed);
        let part = std::fs::metadata(engine.store.part_path(&by_path.id)).expect("part");
        assert_eq!(part.len(), 4096);

        let by_name = engine.init("photo.jpg", "", 1, 1).await.expect("init");
        let session = engine.status(&by_name.id).await.expect("status");
        assert_eq!(session.target_relative_path, "photo.jpg");
    }

    #[tokio::test]
    async fn chunk_rejects_bad_ranges_and_unknown_ids() {
        let (_temp, engine) = make_engine(small_config()).await;
        let init = engine.init("a.bin", "a.bin", 10, 5).await.expect("init");

        assert!(matches!(
            send(&engine, &init.id, 8, b"12345").await,
            Err(UploadError::InvalidArgument(_))
        ));
        assert!(matches!(
            send(&engine, &init.id, u64::MAX, b"1").await,
            Err(UploadError::InvalidArgument(_))
        ));
        assert!(matches!(
            send(&engine, &init.id, 0, b"").await,
            Err(UploadError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.chunk(&init.id, 0, MIB + 1, &b""[..]).await,
            Err(UploadError::InvalidArgument(_))
        ));
        assert!(matches!(
            send(&engine, &crate::session::new_session_id(), 0, b"1").await,
            Err(UploadError::NotFound)
        ));
        assert!(matches!(
            send(&engine, "../escape", 0, b"1").await,
            Err(UploadError::NotFound)
        ));

        let session = engine.status(&init.id).await.expect("status");
        assert_eq!(session.received_extent, 0);
    }

    #[tokio::test]
    async fn short_stream_leaves_extent_unchanged() {
        let (_temp, engine) = make_engine(small_config()).await;
        let init = engine.init("a.bin", "a.bin", 10, 5).await.expect("init");

        let result = engine.chunk(&init.id, 5, 5, &b"BB"[..]).await;
        assert!(matches!(result, Err(UploadError::ShortWrite { .. })));

        assert_eq!(send(&engine, &init.id, 0, b"AA").await.expect("chunk"), 2);
        assert_eq!(send(&engine, &init.id, 5, b"BBBBB").await.expect("retry"), 10);
    }

    #[tokio::test]
    async fn extent_is_monotonic_for_out_of_order_chunks() {
        let (_temp, engine) = make_engine(small_config()).await;
        let init = engine.init("a.bin", "a.bin", 20, 5).await.expect("init");

        let mut observed = Vec::new();
        for offset in [10u64, 0, 5, 15] {
            let data = vec![b'a' + offset as u8; 5];
            observed.push(send(&engine, &init.id, offset, &data).await.expect("chunk"));
        }
        assert_eq!(observed, vec![15, 15, 15, 20]);
        assert!(observed.windows(2).all(|pair| pair[0] <= pair[1]));

        let final_path = engine.complete(&init.id).await.expect("complete");
        let contents = std::fs::read(final_path).expect("read");
        assert_eq!(contents.len(), 20);
        assert_eq!(&contents[10..15], b"kkkkk");
    }

    #[tokio::test]
    async fn complete_requires_full_extent_and_is_idempotent() {
        let (_temp, engine) = make_engine(small_config()).await;
        let init = engine.init("a.bin", "a.bin", 10, 5).await.expect("init");

        send(&engine, &init.id, 0, b"AAAAA").await.expect("chunk");
        assert!(matches!(
            engine.complete(&init.id).await,
            Err(UploadError::Conflict(_))
        ));

        send(&engine, &init.id, 5, b"BBBBB").await.expect("chunk");
        let first = engine.complete(&init.id).await.expect("complete");
        let second = engine.complete(&init.id).await.expect("complete again");
        assert_eq!(first, second);

        assert!(matches!(
            send(&engine, &init.id, 0, b"AAAAA").await,
            Err(UploadError::Conflict(_))
        ));
        assert!(matches!(
            engine.cancel(&init.id).await,
            Err(UploadError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn complete_trusts_extent_without_checking_coverage() {
        let (_temp, engine) = make_engine(small_config()).await;
        let init = engine.init("a.bin", "a.bin", 10, 5).await.expect("init");

        send(&engine, &init.id, 5, b"BBBBB").await.expect("chunk");
        let final_path = engine.complete(&init.id).await.expect("complete");
        assert_eq!(std::fs::read(final_path).expect("read"), b"\0\0\0\0\0BBBBB");
    }

    #[tokio::test]
    async fn failed_finalize_can_be_retried() {
        let (_temp, engine) = make_engine(small_config()).await;
        let init = engine.init("a.bin", "x/a.bin", 5, 5).await.expect("init");
        send(&engine, &init.id, 0, b"AAAAA").await.expect("chunk");

        let blocker = engine.storage().root_path().join("x").join("a.bin");
        std::fs::create_dir_all(blocker.join("occupied")).expect("blocker");
        assert!(matches!(
            engine.complete(&init.id).await,
            Err(UploadError::Io(_))
        ));
        let session = engine.status(&init.id).await.expect("status");
        assert!(!session.completed);
        assert!(engine.store.part_path(&init.id).exists());

        std::fs::remove_dir_all(&blocker).expect("remove blocker");
        let final_path = engine.complete(&init.id).await.expect("retry complete");
        assert_eq!(std::fs::read(final_path).expect("read"), b"AAAAA");
    }

    #[tokio::test]
    async fn cancel_removes_artifacts_and_forgets_session() {
        let (_temp, engine) = make_engine(small_config()).await;
        let init = engine.init("a.bin", "a.bin", 10, 5).await.expect("init");
        send(&engine, &init.id, 0, b"AAAAA").await.expect("chunk");
        assert_eq!(engine.lock_count().await, 1);

        engine.cancel(&init.id).await.expect("cancel");
        assert_eq!(state_entries(&engine), 0);
        assert_eq!(engine.lock_count().await, 0);

        assert!(matches!(
            engine.status(&init.id).await,
            Err(UploadError::NotFound)
        ));
        assert!(matches!(
            send(&engine, &init.id, 5, b"BBBBB").await,
            Err(UploadError::NotFound)
        ));
        assert!(matches!(
            engine.complete(&init.id).await,
            Err(UploadError::NotFound)
        ));
        assert!(matches!(
            engine.cancel(&init.id).await,
            Err(UploadError::NotFound)
        ));
        assert_eq!(engine.lock_count().await, 0);
    }

    #[tokio::test]
    async fn metadata_flush_is_throttled() {
        let mut config = small_config();
        config.persist_threshold = 4;
        let (_temp, engine) = make_engine(config).await;
        let init = engine.init("a.bin", "a.bin", 10, 2).await.expect("init");
        let durable = |engine: &UploadEngine| {
            let id = init.id.clone();
            let path = engine.store.meta_path(&id);
            async move {
                let bytes = tokio::fs::read(path).await.expect("read meta");
                serde_json::from_slice::<Session>(&bytes)
                    .expect("parse meta")
                    .received_extent
            }
        };

        assert_eq!(send(&engine, &init.id, 0, b"aa").await.expect("chunk"), 2);
        assert_eq!(durable(&engine).await, 0);
        assert_eq!(send(&engine, &init.id, 2, b"bbb").await.expect("chunk"), 5);
        assert_eq!(durable(&engine).await, 5);
        assert_eq!(send(&engine, &init.id, 5, b"cc").await.expect("chunk"), 7);
        assert_eq!(durable(&engine).await, 5);
        assert_eq!(engine.status(&init.id).await.expect("status").received_extent, 5);
        assert_eq!(send(&engine, &init.id, 7, b"ddd").await.expect("chunk"), 10);
        assert_eq!(durable(&engine).await, 10);
    }

    #[tokio::test]
    async fn corrupt_metadata_is_reported() {
        let (_temp, engine) = make_engine(small_config()).await;
        let init = engine.init("a.bin", "a.bin", 10, 5).await.expect("init");
        std::fs::write(engine.store.meta_path(&init.id), b"not json").expect("corrupt");

        assert!(matches!(
            engine.status(&init.id).await,
            Err(UploadError::Corrupt(_))
        ));
        assert!(matches!(
            send(&engine, &init.id, 0, b"AAAAA").await,
            Err(UploadError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_disjoint_chunks_on_one_session() {
        const PIECES: u64 = 16;
        const PIECE: u64 = 4096;
        let (_temp, engine) = make_engine(small_config()).await;
        let engine = Arc::new(engine);
        let init = engine
            .init("big.bin", "big.bin", PIECES * PIECE, PIECE)
            .await
            .expect("init");

        let tasks: Vec<_> = (0..PIECES)
            .rev()
            .map(|index| {
                let engine = engine.clone();
                let id = init.id.clone();
                tokio::spawn(async move {
                    let data = vec![index as u8; PIECE as usize];
                    engine
                        .chunk(&id, index * PIECE, PIECE, &data[..])
                        .await
                        .expect("chunk")
                })
            })
            .collect();
        let mut max_seen = 0;
        for task in tasks {
            max_seen = max_seen.max(task.await.expect("join"));
        }
        assert_eq!(max_seen, PIECES * PIECE);
        assert_eq!(
            engine.status(&init.id).await.expect("status").received_extent,
            PIECES * PIECE
        );

        let final_path = engine.complete(&init.id).await.expect("complete");
        let contents = std::fs::read(final_path).expect("read");
        for (index, piece) in contents.chunks(PIECE as usize).enumerate() {
            assert!(piece.iter().all(|byte| *byte == index as u8));
        }
    }

    #[tokio::test]
    async fn tree_excludes_state_dir() {
        let (_temp, engine) = make_engine(small_config()).await;
        std::fs::create_dir_all(engine.storage().root_path().join("photos/2024"))
            .expect("mkdir");
        engine.init("a.bin", "a.bin", 10, 5).await.expect("init");

        let tree = engine.tree(4, 5000).await.expect("tree");
        assert_eq!(tree.rel_path, "");
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].rel_path, "photos");
        assert_eq!(tree.children[0].children[0].rel_path, "photos/2024");
    }

    #[tokio::test]
    async fn reaper_cancels_idle_and_releases_completed() {
        let (_temp, engine) = make_engine(small_config()).await;
        let idle = engine.init("a.bin", "a.bin", 10, 5).await.expect("init");
        let done = engine.init("b.bin", "b.bin", 5, 5).await.expect("init");
        send(&engine, &done.id, 0, b"BBBBB").await.expect("chunk");
        engine.complete(&done.id).await.expect("complete");
        assert_eq!(engine.lock_count().await, 1);

        let untouched = engine.reap_stale(Duration::from_secs(3600)).await.expect("reap");
        assert_eq!(untouched.cancelled, 0);
        assert!(engine.status(&idle.id).await.is_ok());

        let report = engine.reap_stale(Duration::ZERO).await.expect("reap");
        assert_eq!(report, ReapReport { cancelled: 1, released: 1 });
        assert!(matches!(
            engine.status(&idle.id).await,
            Err(UploadError::NotFound)
        ));
        assert!(engine.status(&done.id).await.expect("status").completed);
        assert_eq!(engine.lock_count().await, 0);
    }

    #[tokio::test]
    async fn reaper_spares_session_with_chunk_in_flight() {
        use tokio::io::AsyncWriteExt;

        let (_temp, engine) = make_engine(small_config()).await;
        let engine = Arc::new(engine);
        let init = engine.init("a.bin", "a.bin", 10, 5).await.expect("init");
        tokio::time::sleep(Duration::from_millis(300)).await;

        let (mut body_tx, body_rx) = tokio::io::duplex(64);
        let writer = {
            let engine = engine.clone();
            let id = init.id.clone();
            tokio::spawn(async move { engine.chunk(&id, 0, 5, body_rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reaper = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.reap_stale(Duration::from_millis(200)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        body_tx.write_all(b"AAAAA").await.expect("feed body");

        let written = writer.await.expect("join writer").expect("chunk accepted");
        assert_eq!(written, 5);
        let report = reaper.await.expect("join reaper").expect("reap");
        assert_eq!(report.cancelled, 0);
        assert!(engine.status(&init.id).await.is_ok());
        assert!(engine.store.part_path(&init.id).exists());
    }

    #[tokio::test]
    async fn complete_recovers_when_part_was_already_moved() {
        let (_temp, engine) = make_engine(small_config()).await;
        let init = engine.init("a.bin", "x/a.bin", 5, 5).await.expect("init");
        send(&engine, &init.id, 0, b"AAAAA").await.expect("chunk");

        let final_path = engine.storage().root_path().join("x").join("a.bin");
        std::fs::create_dir_all(final_path.parent().expect("parent")).expect("mkdir");
        std::fs::rename(engine.store.part_path(&init.id), &final_path).expect("move part");
        assert!(!engine.status(&init.id).await.expect("status").completed);

        let completed = engine.complete(&init.id).await.expect("complete");
        assert_eq!(completed, final_path);
        assert!(engine.status(&init.id).await.expect("status").completed);
        assert_eq!(std::fs::read(&final_path).expect("read"), b"AAAAA");
    }

    #[tokio::test]
    async fn complete_reports_missing_part_without_final_file() {
        let (_temp, engine) = make_engine(small_config()).await;
        let init = engine.init("a.bin", "a.bin", 5, 5).await.expect("init");
        send(&engine, &init.id, 0, b"AAAAA").await.expect("chunk");
        std::fs::remove_file(engine.store.part_path(&init.id)).expect("remove part");

        assert!(matches!(
            engine.complete(&init.id).await,
            Err(UploadError::Io(_))
        ));
        assert!(!engine.status(&init.id).await.expect("status").completed);
    }
}
