//! 队列保存节流
//!
//! 任何改动只设置脏标记并唤醒保存任务，保存任务等待最小间隔后整体保存一次，
//! 期间的连续改动被合并。关闭时走 `DownloadQueue::save_and_wait` 同步保存。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::downloader::{ChunkEvent, ChunkEventSink};
use crate::error::{QueueError, QueueResult};
use crate::persistence::{save_queue, PersistedQueue};
use crate::queue::DownloadQueue;

pub struct QueueSaver {
    path: PathBuf,
    min_interval: Duration,
    dirty: AtomicBool,
    notify: Notify,
    /// 串行化保存
    save_lock: tokio::sync::Mutex<()>,
}

impl QueueSaver {
    pub fn new(path: PathBuf, min_interval: Duration) -> Self {
        Self {
            path,
            min_interval,
            dirty: AtomicBool::new(false),
            notify: Notify::new(),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// 立即保存快照
    pub(crate) async fn save_now(&self, snapshot: PersistedQueue) -> QueueResult<()> {
        let _guard = self.save_lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || save_queue(&path, &snapshot))
            .await
            .map_err(|e| QueueError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    /// 后台保存循环
    pub(crate) async fn run(self: Arc<Self>, queue: Weak<DownloadQueue>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = token.cancelled() => break,
            }
            // 合并最小间隔内的所有改动
            tokio::select! {
                _ = tokio::time::sleep(self.min_interval) => {}
                _ = token.cancelled() => break,
            }
            if !self.dirty.swap(false, Ordering::SeqCst) {
                continue;
            }

            let Some(snapshot) = queue.upgrade().map(|q| q.snapshot()) else {
                break;
            };
            match self.save_now(snapshot).await {
                Ok(()) => debug!("下载队列已保存"),
                Err(e) => {
                    error!("保存下载队列失败，保留上一次的文件: {}", e);
                    // 下一个周期重试
                    self.mark_dirty();
                }
            }
        }
        debug!("队列保存任务退出");
    }
}

impl ChunkEventSink for QueueSaver {
    fn chunk_started(&self, _event: &ChunkEvent) {
        self.mark_dirty();
    }

    fn chunk_transfer(&self, _event: &ChunkEvent, _bytes: u64, _interval: Duration) {
        self.mark_dirty();
    }

    fn chunk_ended(&self, _event: &ChunkEvent) {
        self.mark_dirty();
    }
}
