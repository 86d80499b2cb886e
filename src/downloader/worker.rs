//! 下载工作器接口
//!
//! 一个工作器负责一个文件的所有分片传输，每个活动分片占用一个执行单元（一个 tokio 任务）。
//! 分片生命周期事件通过 `ChunkEventSink` 上报，工作器只在释放自身锁之后才触发事件。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::downloader::chunk::{ChunkId, ChunkStatus, DownloadChunk};
use crate::downloader::info::DownloadInfo;
use crate::downloader::DownloadSource;

/// 分片事件
#[derive(Debug, Clone)]
pub struct ChunkEvent {
    pub info: Arc<DownloadInfo>,
    /// 事件发生时的分片快照
    pub chunk: DownloadChunk,
    pub source: DownloadSource,
}

/// 分片生命周期事件的接收者
pub trait ChunkEventSink: Send + Sync {
    fn chunk_started(&self, _event: &ChunkEvent) {}
    fn chunk_transfer(&self, _event: &ChunkEvent, _bytes: u64, _interval: Duration) {}
    fn chunk_ended(&self, _event: &ChunkEvent) {}
    fn chunk_queued(&self, _event: &ChunkEvent) {}
    fn chunk_unqueued(&self, _event: &ChunkEvent) {}
}

/// 下载工作器
pub trait DownloadWorker: Send + Sync {
    fn info(&self) -> &Arc<DownloadInfo>;

    /// 用 `source` 开始传输分片，在 `executor` 上启动执行单元后立即返回
    fn download_chunk(&self, chunk: ChunkId, source: DownloadSource, executor: &Handle) -> bool;

    /// 把活动分片未下载的后半段拆成新分片；不支持多源时返回 None
    fn split_chunk(&self, chunk: ChunkId) -> Option<DownloadChunk>;

    fn active_chunk_count(&self) -> usize;

    fn incomplete_inactive_chunks(&self) -> Vec<ChunkId> {
        self.info().incomplete_inactive()
    }

    fn downloading_chunks(&self) -> Vec<DownloadChunk> {
        self.info()
            .active_chunks()
            .into_iter()
            .filter(|c| c.status == ChunkStatus::Downloading)
            .collect()
    }

    /// 活动分片正在使用的下载源
    fn active_sources(&self) -> Vec<DownloadSource> {
        self.info()
            .active_chunks()
            .into_iter()
            .filter_map(|c| c.source)
            .collect()
    }

    /// 强制结束一个活动分片（保留已下载数据），活动计数立即减一
    fn kill_a_chunk(&self) -> bool;

    /// 彻底放弃：结束所有分片并删除本地残留
    fn cancel(&self);

    /// 结束所有分片，保留本地数据以便续传
    fn shutdown(&self);

    /// 至少有一个活动分片且全部走加密通道
    fn is_secure(&self) -> bool {
        let active = self.info().active_chunks();
        !active.is_empty() && active.iter().all(|c| c.secure)
    }
}

/// 为文件创建工作器
pub trait WorkerFactory: Send + Sync {
    fn create(&self, info: Arc<DownloadInfo>, sink: Weak<dyn ChunkEventSink>) -> Arc<dyn DownloadWorker>;
}

/// 一个执行单元
#[derive(Debug, Clone)]
pub struct ChunkUnit {
    pub chunk: ChunkId,
    pub lease: u64,
    pub source: DownloadSource,
    pub token: CancellationToken,
}

/// 各工作器实现共用的执行单元簿记
pub struct WorkerCore {
    info: Arc<DownloadInfo>,
    sink: Weak<dyn ChunkEventSink>,
    root: CancellationToken,
    units: Mutex<HashMap<ChunkId, ChunkUnit>>,
    stopped: AtomicBool,
    cancelled: AtomicBool,
    /// 仍在运行的执行单元任务数（包括已被移出计数、尚未退出的）
    running: AtomicUsize,
}

impl WorkerCore {
    pub fn new(info: Arc<DownloadInfo>, sink: Weak<dyn ChunkEventSink>) -> Self {
        Self {
            info,
            sink,
            root: CancellationToken::new(),
            units: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            running: AtomicUsize::new(0),
        }
    }

    pub fn info(&self) -> &Arc<DownloadInfo> {
        &self.info
    }

    /// 登记一个新的执行单元，工作器已停止或分片不可启动时返回 None
    pub fn begin(&self, chunk: ChunkId, source: DownloadSource) -> Option<ChunkUnit> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        let lease = self.info.activate(chunk, &source)?;
        let unit = ChunkUnit {
            chunk,
            lease,
            source,
            token: self.root.child_token(),
        };
        self.units.lock().insert(chunk, unit.clone());
        self.running.fetch_add(1, Ordering::SeqCst);
        Some(unit)
    }

    /// 执行单元退出：释放分片并上报 chunk_ended，返回仍在运行的任务数
    pub fn finish(&self, unit: &ChunkUnit) -> usize {
        {
            let mut units = self.units.lock();
            if units.get(&unit.chunk).map(|u| u.lease) == Some(unit.lease) {
                units.remove(&unit.chunk);
            }
        }
        let ended = self.info.deactivate(unit.chunk, unit.lease);
        let remaining = self.running.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);

        if let Some(chunk) = ended {
            self.emit(chunk, &unit.source, |sink, event| sink.chunk_ended(event));
        }
        remaining
    }

    pub fn active_count(&self) -> usize {
        self.units.lock().len()
    }

    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// 结束最近启动的一个执行单元
    pub fn kill_one(&self) -> bool {
        let victim = {
            let mut units = self.units.lock();
            let Some(chunk) = units.values().max_by_key(|u| u.lease).map(|u| u.chunk) else {
                return false;
            };
            units.remove(&chunk)
        };
        match victim {
            Some(unit) => {
                debug!("结束分片 {}: 文件={}", unit.chunk, self.info.file_name());
                unit.token.cancel();
                true
            }
            None => false,
        }
    }

    /// 停止所有执行单元
    pub fn stop(&self, cancel: bool) {
        self.stopped.store(true, Ordering::SeqCst);
        if cancel {
            self.cancelled.store(true, Ordering::SeqCst);
        }
        self.units.lock().clear();
        self.root.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 以分片当前快照触发事件（调用时不得持有任何工作器锁）
    pub fn emit<F>(&self, chunk: DownloadChunk, source: &DownloadSource, f: F)
    where
        F: FnOnce(&dyn ChunkEventSink, &ChunkEvent),
    {
        let Some(sink) = self.sink.upgrade() else {
            return;
        };
        let event = ChunkEvent {
            info: self.info.clone(),
            chunk,
            source: source.clone(),
        };
        f(sink.as_ref(), &event);
    }

    /// 以分片最新状态触发事件
    pub fn emit_current<F>(&self, unit: &ChunkUnit, f: F)
    where
        F: FnOnce(&dyn ChunkEventSink, &ChunkEvent),
    {
        if let Some(chunk) = self.info.chunk(unit.chunk) {
            self.emit(chunk, &unit.source, f);
        }
    }
}
