//! 下载控制器
//!
//! 对外的门面：持有队列、调度器、限速器和活动分片表，负责启动顺序和关闭顺序
//! （先停调度器，再保存并关闭队列）。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collaborators::{Collaborators, RemoteEntry};
use crate::common::ProgressTracker;
use crate::config::AppConfig;
use crate::downloader::bandwidth::BandwidthLimiter;
use crate::downloader::chunk::ChunkStatus;
use crate::downloader::dispatcher::{DispatcherTuning, DownloadDispatcher};
use crate::downloader::http_worker::HttpWorkerFactory;
use crate::downloader::worker::{ChunkEvent, ChunkEventSink, WorkerFactory};
use crate::events::{QueueEvent, RowKey, TableEvent, UpdateCoalescer};
use crate::queue::{DownloadQueue, ItemId, SubmitListener};

/// 活动分片表的一行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkRow {
    pub file_name: String,
    pub peer: String,
    pub status: ChunkStatus,
    /// 分片完成百分比 (0-100)
    pub percent: f64,
    /// 分片速度 (bytes/s)
    pub speed: f64,
    pub secure: bool,
}

impl ChunkRow {
    fn from_event(event: &ChunkEvent) -> Self {
        Self {
            file_name: event.info.file_name().to_string(),
            peer: event.source.peer.clone(),
            status: event.chunk.status,
            percent: event.chunk.percent(),
            speed: event.chunk.tracker.as_ref().map_or(0.0, |t| t.speed()),
            secure: event.chunk.secure,
        }
    }
}

/// 当前活动分片表，变更按 UI 事件间隔批量广播
pub struct ActiveChunkTable {
    rows: DashMap<RowKey, ChunkRow>,
    events: Arc<UpdateCoalescer<TableEvent>>,
}

impl ActiveChunkTable {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            events: Arc::new(UpdateCoalescer::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<TableEvent>> {
        self.events.subscribe()
    }

    pub fn row(&self, key: &RowKey) -> Option<ChunkRow> {
        self.rows.get(key).map(|row| row.clone())
    }

    pub fn rows(&self) -> Vec<(RowKey, ChunkRow)> {
        self.rows
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn spawn_flusher(&self, interval: std::time::Duration, token: CancellationToken) -> JoinHandle<()> {
        self.events.spawn_flusher(interval, token)
    }

    fn key(event: &ChunkEvent) -> RowKey {
        RowKey {
            item: event.info.item(),
            chunk: event.chunk.id,
        }
    }

    fn update(&self, event: &ChunkEvent) {
        let key = Self::key(event);
        // 行已被移除时不再复活
        if let Some(mut row) = self.rows.get_mut(&key) {
            *row = ChunkRow::from_event(event);
            drop(row);
            self.events.push(TableEvent::Updated(key));
        }
    }
}

impl Default for ActiveChunkTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkEventSink for ActiveChunkTable {
    fn chunk_started(&self, event: &ChunkEvent) {
        let key = Self::key(event);
        self.rows.insert(key, ChunkRow::from_event(event));
        self.events.push(TableEvent::Inserted(key));
    }

    fn chunk_transfer(&self, event: &ChunkEvent, _bytes: u64, _interval: std::time::Duration) {
        self.update(event);
    }

    fn chunk_ended(&self, event: &ChunkEvent) {
        let key = Self::key(event);
        if self.rows.remove(&key).is_some() {
            self.events.push(TableEvent::Removed(key));
        }
    }

    fn chunk_queued(&self, event: &ChunkEvent) {
        self.update(event);
    }

    fn chunk_unqueued(&self, event: &ChunkEvent) {
        self.update(event);
    }
}

/// 下载控制器
pub struct DownloadController {
    config: Mutex<AppConfig>,
    config_path: Option<PathBuf>,
    aggregate: Arc<ProgressTracker>,
    queue: Arc<DownloadQueue>,
    dispatcher: DownloadDispatcher,
    limiter: Arc<BandwidthLimiter>,
    table: Arc<ActiveChunkTable>,
    shutdown: CancellationToken,
    table_flusher: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadController {
    /// 打开队列并启动调度
    ///
    /// 队列状态目录不可用时返回的错误可 downcast 为 `QueueError::StateDirUnavailable`。
    /// `factory` 为 None 时使用 HTTP 工作器。
    pub async fn start(
        mut config: AppConfig,
        config_path: Option<PathBuf>,
        collaborators: Collaborators,
        factory: Option<Arc<dyn WorkerFactory>>,
    ) -> Result<Self> {
        config.download.validate();

        let aggregate = Arc::new(ProgressTracker::new());
        let queue = DownloadQueue::open(
            config.queue.clone(),
            &config.download.download_dir,
            collaborators.lookup.clone(),
            aggregate.clone(),
        )
        .await?;

        let limiter = Arc::new(BandwidthLimiter::new(config.download.speed_limit_kbps));
        let factory: Arc<dyn WorkerFactory> = match factory {
            Some(factory) => factory,
            None => Arc::new(HttpWorkerFactory::new(&config.download, limiter.clone())?),
        };

        let shutdown = CancellationToken::new();
        let table = Arc::new(ActiveChunkTable::new());
        let table_flusher = table.spawn_flusher(config.queue.ui_event_interval(), shutdown.clone());

        let listeners: Vec<Arc<dyn ChunkEventSink>> = vec![queue.saver().clone(), table.clone()];
        let dispatcher = DownloadDispatcher::new(
            queue.clone(),
            collaborators,
            factory,
            listeners,
            config.download.max_active_slots,
            config.download.max_slots_per_file,
            DispatcherTuning::from(&config.download),
        );

        let controller = Self {
            config: Mutex::new(config),
            config_path,
            aggregate,
            queue,
            dispatcher,
            limiter,
            table,
            shutdown,
            table_flusher: Mutex::new(Some(table_flusher)),
        };
        controller.recalculate_remaining();
        controller.dispatcher.start();
        info!("下载控制器已启动");
        Ok(controller)
    }

    /// 整个队列的汇总进度
    pub fn aggregate(&self) -> &Arc<ProgressTracker> {
        &self.aggregate
    }

    pub fn queue(&self) -> &Arc<DownloadQueue> {
        &self.queue
    }

    pub fn dispatcher(&self) -> &DownloadDispatcher {
        &self.dispatcher
    }

    pub fn chunk_table(&self) -> &Arc<ActiveChunkTable> {
        &self.table
    }

    /// 订阅活动分片表变更
    pub fn subscribe_chunks(&self) -> broadcast::Receiver<Vec<TableEvent>> {
        self.table.subscribe()
    }

    /// 订阅队列变更
    pub fn subscribe_queue(&self) -> broadcast::Receiver<Vec<QueueEvent>> {
        self.queue.subscribe()
    }

    // ========================================================================
    // 设置
    // ========================================================================

    pub fn speed_limit_kbps(&self) -> u64 {
        self.limiter.limit_kbps()
    }

    pub async fn set_speed_limit_kbps(&self, limit_kbps: u64) {
        self.limiter.set_limit_kbps(limit_kbps);
        self.config.lock().download.speed_limit_kbps = limit_kbps;
        self.save_config().await;
    }

    /// (全局槽位, 单文件槽位)
    pub fn slot_limits(&self) -> (usize, usize) {
        (
            self.dispatcher.max_active_slots(),
            self.dispatcher.max_slots_per_file(),
        )
    }

    pub async fn set_slot_limits(&self, max_active_slots: usize, max_slots_per_file: usize) {
        self.dispatcher.set_limits(max_active_slots, max_slots_per_file);
        {
            let mut config = self.config.lock();
            config.download.max_active_slots = self.dispatcher.max_active_slots();
            config.download.max_slots_per_file = self.dispatcher.max_slots_per_file();
        }
        self.save_config().await;
    }

    pub fn default_dir(&self) -> PathBuf {
        self.config.lock().download.download_dir.clone()
    }

    pub async fn set_default_dir(&self, path: PathBuf) {
        self.queue.set_default_dir(path.clone());
        self.config.lock().download.download_dir = path;
        self.save_config().await;
    }

    /// 没有配置文件路径时只修改内存中的配置
    async fn save_config(&self) {
        let Some(path) = &self.config_path else {
            return;
        };
        let config = self.config.lock().clone();
        if let Err(e) = config.save_to_file(path).await {
            warn!("保存配置失败: {:#}", e);
        }
    }

    // ========================================================================
    // 队列操作
    // ========================================================================

    pub fn submit(
        &self,
        target_dir: PathBuf,
        entries: Vec<RemoteEntry>,
        into_subdir: bool,
        listener: Option<Arc<dyn SubmitListener>>,
    ) -> JoinHandle<()> {
        self.queue.submit(target_dir, entries, into_subdir, listener)
    }

    /// 提交到默认下载目录
    pub fn submit_to_default(&self, entries: Vec<RemoteEntry>) -> JoinHandle<()> {
        self.submit(self.default_dir(), entries, true, None)
    }

    pub fn promote(&self, id: ItemId) {
        self.queue.promote(id);
        self.dispatcher.wake();
    }

    pub fn status_text(&self, id: ItemId) -> Option<String> {
        self.queue.status_text(id)
    }

    /// 取消一个队列节点（文件或目录）
    ///
    /// 先从队列移除整棵子树，再停止其中正在下载的文件，最后删除未完成的本地数据。
    /// 路径上嵌套在其下的其他顶层目录不受影响。
    pub async fn cancel(&self, id: ItemId) {
        let Some(path) = self.queue.item_path(id) else {
            return;
        };

        let infos = self.queue.cancel(id).await;
        let cancelled = self.dispatcher.cancel_downloads(&infos);

        // 正在运行的工作器自己清理，这里只处理空闲文件留下的数据
        for info in infos {
            if cancelled.iter().any(|c| Arc::ptr_eq(c, &info)) || info.bytes_downloaded() == 0 {
                continue;
            }
            remove_partial(info.save_path()).await;
        }

        self.recalculate_remaining();
        info!("已取消: {:?}", path);
    }

    /// 清除文件的错误标记，让它重新参与调度
    pub fn retry(&self, id: ItemId) {
        self.queue.clear_error(id);
        self.dispatcher.wake();
    }

    /// 停止所有工作器并重新派发
    pub fn requeue(&self) {
        self.dispatcher.requeue();
    }

    /// 按队列实际剩余量重置汇总进度的总量
    pub fn recalculate_remaining(&self) {
        let remaining = self.queue.calculate_size();
        self.aggregate
            .set_expected_maximum(self.aggregate.completed() + remaining);
    }

    pub fn new_peers_present(&self) {
        self.dispatcher.new_peers_present();
    }

    /// 先停调度器，再保存并关闭队列
    pub async fn shutdown(&self) {
        info!("正在关闭下载控制器");
        self.dispatcher.stop().await;
        self.queue.shutdown().await;

        self.shutdown.cancel();
        let flusher = self.table_flusher.lock().take();
        if let Some(flusher) = flusher {
            let _ = flusher.await;
        }
        info!("下载控制器已关闭");
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!("已删除未完成文件: {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除未完成文件失败: {:?}: {}", path, e),
    }
}
