//! 按会话 id 分配的内存锁：串行化同一会话的写操作。

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// 会话锁保护的内存进度，用于元数据落盘节流。
#[derive(Debug, Default)]
pub struct SessionProgress {
    /// 本进程内观察到的最大已接收位置。
    pub received_extent: u64,
    /// 最近一次写入元数据时的已接收位置。
    pub flushed_extent: u64,
}

/// Manages one asynchronous mutex per upload session id.
///
/// Entries are created lazily and only removed through [`SessionLocks::release`];
/// without a reaper the map grows with the number of distinct ids seen.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<SessionProgress>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取会话锁，首次使用时创建。
    pub async fn acquire(&self, id: &str) -> OwnedMutexGuard<SessionProgress> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SessionProgress::default())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// 移除会话锁条目；已持有该锁的调用方不受影响。
    pub async fn release(&self, id: &str) {
        self.locks.lock().await.remove(id);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}
