//! 下载调度器
//!
//! 唯一的调度决策者。调度循环按固定周期迭代（有文件完成时立即再跑一轮），每轮依次：
//!
//! 1. 裁剪：全局活动分片数超过 `max_active_slots` 时轮流结束分片，再逐个文件裁到 `max_slots_per_file`
//! 2. 派发新文件：有空闲槽位时向队列要下一个未开始的文件，查询下载源并启动第一个分片
//! 3. 续传或拆分：仍有空闲槽位时，优先续传未完成的非活动分片，否则拆分一个合格的活动分片；
//!    每轮最多做一次
//!
//! 调度状态（工作器列表）由一把锁保护，锁内不做任何 await。

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collaborators::Collaborators;
use crate::config::DownloadConfig;
use crate::downloader::chunk::{ChunkId, ChunkStatus, DownloadChunk};
use crate::downloader::info::DownloadInfo;
use crate::downloader::worker::{ChunkEvent, ChunkEventSink, DownloadWorker, WorkerFactory};
use crate::downloader::DownloadSource;
use crate::queue::{DownloadQueue, QueuedFile};

/// 调度参数
#[derive(Debug, Clone)]
pub struct DispatcherTuning {
    pub dispatch_interval: Duration,
    /// 分片下载超过这个时长才允许拆分
    pub min_split_interval: Duration,
    /// 分片完成度低于这个百分比才允许拆分
    pub split_threshold_percent: u8,
    pub source_lookup_timeout: Duration,
}

impl From<&DownloadConfig> for DispatcherTuning {
    fn from(config: &DownloadConfig) -> Self {
        Self {
            dispatch_interval: config.dispatch_interval(),
            min_split_interval: config.min_split_interval(),
            split_threshold_percent: config.split_threshold_percent,
            source_lookup_timeout: config.source_lookup_timeout(),
        }
    }
}

impl Default for DispatcherTuning {
    fn default() -> Self {
        Self::from(&DownloadConfig::default())
    }
}

#[derive(Default)]
struct DispatcherState {
    workers: Vec<Arc<dyn DownloadWorker>>,
    /// 全局裁剪的轮转位置
    kill_cursor: usize,
}

impl DispatcherState {
    fn active_total(&self) -> usize {
        self.workers.iter().map(|w| w.active_chunk_count()).sum()
    }

    fn position_of(&self, info: &Arc<DownloadInfo>) -> Option<usize> {
        self.workers.iter().position(|w| Arc::ptr_eq(w.info(), info))
    }
}

pub(crate) struct DispatcherInner {
    queue: Arc<DownloadQueue>,
    collaborators: Collaborators,
    factory: Arc<dyn WorkerFactory>,
    listeners: Vec<Arc<dyn ChunkEventSink>>,
    max_active: AtomicUsize,
    max_per_file: AtomicUsize,
    tuning: DispatcherTuning,
    state: Mutex<DispatcherState>,
    wake: Notify,
    /// 本轮有文件完成，下一轮不等待
    completed: AtomicBool,
    shutdown: CancellationToken,
    executor: Handle,
    /// 保证迭代严格串行
    iteration: tokio::sync::Mutex<()>,
    iterations: AtomicU64,
    self_weak: Weak<DispatcherInner>,
}

/// 下载调度器
pub struct DownloadDispatcher {
    inner: Arc<DispatcherInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadDispatcher {
    /// 创建调度器（不启动循环），分片任务运行在当前 tokio 运行时上
    pub fn new(
        queue: Arc<DownloadQueue>,
        collaborators: Collaborators,
        factory: Arc<dyn WorkerFactory>,
        listeners: Vec<Arc<dyn ChunkEventSink>>,
        max_active_slots: usize,
        max_slots_per_file: usize,
        tuning: DispatcherTuning,
    ) -> Self {
        let inner = Arc::new_cyclic(|me| DispatcherInner {
            queue,
            collaborators,
            factory,
            listeners,
            max_active: AtomicUsize::new(max_active_slots.max(1)),
            max_per_file: AtomicUsize::new(max_slots_per_file.max(1)),
            tuning,
            state: Mutex::new(DispatcherState::default()),
            wake: Notify::new(),
            completed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            executor: Handle::current(),
            iteration: tokio::sync::Mutex::new(()),
            iterations: AtomicU64::new(0),
            self_weak: me.clone(),
        });
        Self {
            inner,
            handle: Mutex::new(None),
        }
    }

    /// 启动调度循环
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        info!(
            "调度器启动: 全局槽位={}, 单文件槽位={}",
            self.max_active_slots(),
            self.max_slots_per_file()
        );
        *handle = Some(tokio::spawn(run_loop(self.inner.clone())));
    }

    /// 立即执行一轮调度
    pub async fn run_once(&self) {
        self.inner.iterate().await;
    }

    /// 唤醒调度循环
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }

    pub fn max_active_slots(&self) -> usize {
        self.inner.max_active.load(Ordering::SeqCst)
    }

    pub fn max_slots_per_file(&self) -> usize {
        self.inner.max_per_file.load(Ordering::SeqCst)
    }

    /// 修改槽位上限，下一轮调度生效
    pub fn set_limits(&self, max_active_slots: usize, max_slots_per_file: usize) {
        self.inner
            .max_active
            .store(max_active_slots.max(1), Ordering::SeqCst);
        self.inner
            .max_per_file
            .store(max_slots_per_file.max(1), Ordering::SeqCst);
        info!(
            "槽位上限已修改: 全局={}, 单文件={}",
            max_active_slots, max_slots_per_file
        );
        self.wake();
    }

    pub fn active_chunk_count(&self) -> usize {
        self.inner.state.lock().active_total()
    }

    /// 已执行的调度轮数
    pub fn iteration_count(&self) -> u64 {
        self.inner.iterations.load(Ordering::SeqCst)
    }

    pub fn worker_count(&self) -> usize {
        self.inner.state.lock().workers.len()
    }

    /// 停止（不取消）所有工作器，由调度循环重新分配
    pub fn requeue(&self) {
        let workers: Vec<_> = self.inner.state.lock().workers.drain(..).collect();
        info!("重新排队: 停止 {} 个工作器", workers.len());
        for worker in workers {
            worker.shutdown();
            worker.info().detach_worker();
        }
        self.wake();
    }

    /// 取消已从队列移除的下载，返回实际停止的下载信息
    ///
    /// 只按下载信息本身匹配，同一路径前缀下仍在队列中的其他文件不受影响
    pub fn cancel_downloads(&self, removed: &[Arc<DownloadInfo>]) -> Vec<Arc<DownloadInfo>> {
        if removed.is_empty() {
            return Vec::new();
        }
        let cancelled: Vec<_> = {
            let mut state = self.inner.state.lock();
            let (matched, kept) = state
                .workers
                .drain(..)
                .partition(|w| removed.iter().any(|info| Arc::ptr_eq(info, w.info())));
            state.workers = kept;
            matched
        };

        for worker in &cancelled {
            debug!("取消下载: {:?}", worker.info().save_path());
            worker.cancel();
            worker.info().detach_worker();
        }
        if !cancelled.is_empty() {
            info!("已取消 {} 个下载", cancelled.len());
            self.wake();
        }
        cancelled.iter().map(|w| w.info().clone()).collect()
    }

    /// 发现新的对端：清除无源标记并立即调度
    pub fn new_peers_present(&self) {
        self.inner.queue.clear_no_sources();
        self.wake();
    }

    /// 停止调度循环，再停止所有工作器（保留本地数据）
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        // 等待正在进行的迭代结束
        let _guard = self.inner.iteration.lock().await;

        let workers: Vec<_> = self.inner.state.lock().workers.drain(..).collect();
        for worker in &workers {
            worker.shutdown();
            worker.info().detach_worker();
        }
        info!("调度器已停止，停止了 {} 个工作器", workers.len());
    }
}

impl Drop for DownloadDispatcher {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

/// 调度循环：每轮迭代在独立任务中执行，迭代内的 panic 只记录日志
async fn run_loop(inner: Arc<DispatcherInner>) {
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        let iteration = tokio::spawn({
            let inner = inner.clone();
            async move { inner.iterate().await }
        });
        if let Err(e) = iteration.await {
            error!("调度迭代异常，下一轮继续: {}", e);
        }

        if inner.completed.swap(false, Ordering::SeqCst) {
            // 完成时留下的唤醒许可由紧接着的这一轮消化掉
            let _ = inner.wake.notified().now_or_never();
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(inner.tuning.dispatch_interval) => {}
            _ = inner.wake.notified() => {}
            _ = inner.shutdown.cancelled() => break,
        }
    }
    debug!("调度循环退出");
}

impl DispatcherInner {
    fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn max_per_file(&self) -> usize {
        self.max_per_file.load(Ordering::SeqCst)
    }

    fn spare_slots(&self) -> usize {
        let active = self.state.lock().active_total();
        self.max_active().saturating_sub(active)
    }

    fn sink(&self) -> Weak<dyn ChunkEventSink> {
        let weak: Weak<DispatcherInner> = self.self_weak.clone();
        weak
    }

    async fn iterate(&self) {
        let _guard = self.iteration.lock().await;
        if self.shutdown.is_cancelled() {
            return;
        }
        let round = self.iterations.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("调度迭代 #{}", round);

        self.clip();

        if let Err(e) = self.dispatch_new_files().await {
            error!("派发新文件失败: {:#}", e);
        }

        if self.spare_slots() > 0 {
            if let Err(e) = self.resume_or_split().await {
                error!("续传/拆分失败: {:#}", e);
            }
        }
    }

    // ========================================================================
    // 1. 裁剪
    // ========================================================================

    fn clip(&self) {
        let max_active = self.max_active();
        let max_per_file = self.max_per_file();
        let mut state = self.state.lock();
        let count = state.workers.len();
        if count == 0 {
            return;
        }

        let mut total = state.active_total();
        let mut misses = 0;
        while total > max_active && misses < count {
            let index = state.kill_cursor % count;
            state.kill_cursor = index + 1;
            if state.workers[index].kill_a_chunk() {
                total -= 1;
                misses = 0;
            } else {
                misses += 1;
            }
        }

        for worker in &state.workers {
            while worker.active_chunk_count() > max_per_file {
                if !worker.kill_a_chunk() {
                    break;
                }
            }
        }
    }

    // ========================================================================
    // 2. 派发新文件
    // ========================================================================

    async fn dispatch_new_files(&self) -> Result<()> {
        while self.spare_slots() > 0 && !self.shutdown.is_cancelled() {
            let Some(file) = self.queue.get_inactive_download_file() else {
                break;
            };
            let name = file.name.clone();
            if let Err(e) = self.dispatch_file(file).await {
                warn!("派发文件失败: {}: {:#}", name, e);
            }
        }
        Ok(())
    }

    async fn dispatch_file(&self, file: QueuedFile) -> Result<()> {
        if file.size == 0 {
            self.complete_empty(&file).await;
            return Ok(());
        }

        if let Some(info) = &file.download {
            if info.is_complete() {
                self.complete_file(info);
                return Ok(());
            }
        } else if self.already_on_disk(&file).await {
            info!("文件已存在且校验一致，跳过下载: {:?}", file.save_path);
            self.queue.aggregate().fold(file.size);
            self.queue.complete(file.id);
            self.signal_completed();
            return Ok(());
        }

        let sources = self.lookup_sources(&file.hash).await;
        let candidates: Vec<DownloadSource> = sources.into_values().collect();
        let Some(source) = self.collaborators.oracle.best_source(&candidates) else {
            debug!("没有下载源: {}", file.name);
            self.queue.mark_no_sources(file.id);
            return Ok(());
        };

        let info = match file.download {
            Some(info) => info,
            None => {
                let info = Arc::new(DownloadInfo::new(
                    file.id,
                    &file.name,
                    &file.save_path,
                    file.size,
                    &file.hash,
                    self.queue.aggregate(),
                ));
                if !self.queue.set_download_info(file.id, Some(info.clone())).await {
                    // 派发期间已被取消
                    return Ok(());
                }
                info
            }
        };

        let Some(chunk) = info.incomplete_inactive().first().copied() else {
            if info.is_complete() {
                self.complete_file(&info);
            }
            return Ok(());
        };

        let (worker, started) = {
            let mut state = self.state.lock();
            // 取消先移除队列节点再停止工作器，在调度锁内复查即可避免漏掉
            if !self.queue.contains(file.id) {
                debug!("派发期间已被取消: {}", file.name);
                return Ok(());
            }
            let worker = self.factory.create(info.clone(), self.sink());
            info.attach_worker(&worker);
            state.workers.push(worker.clone());
            let started = worker.download_chunk(chunk, source.clone(), &self.executor);
            (worker, started)
        };

        if started {
            info!(
                "开始下载: {} ({} bytes), 分片 {}, 对端={}",
                file.name, file.size, chunk, source.peer
            );
            self.queue.notify_changed(file.id);
        } else {
            warn!("工作器无法启动分片: {} {}", file.name, chunk);
            self.remove_worker(&info);
            worker.shutdown();
        }
        Ok(())
    }

    /// 零字节文件：直接创建空文件，不进入分片流程
    async fn complete_empty(&self, file: &QueuedFile) {
        match create_empty_file(&file.save_path).await {
            Ok(()) => {
                info!("✓ 空文件已创建: {:?}", file.save_path);
                self.queue.complete(file.id);
                self.signal_completed();
            }
            Err(e) => {
                error!("创建空文件失败: {:?}: {:#}", file.save_path, e);
                self.queue
                    .set_error(file.id, format!("无法创建空文件: {:#}", e));
            }
        }
    }

    /// 本地文件大小和内容哈希都一致
    async fn already_on_disk(&self, file: &QueuedFile) -> bool {
        let Ok(metadata) = tokio::fs::metadata(&file.save_path).await else {
            return false;
        };
        if !metadata.is_file() || metadata.len() != file.size {
            return false;
        }
        match self.collaborators.verifier.digest(&file.save_path).await {
            Ok(digest) => digest.eq_ignore_ascii_case(&file.hash),
            Err(e) => {
                debug!("本地文件校验失败: {:?}: {:#}", file.save_path, e);
                false
            }
        }
    }

    async fn lookup_sources(&self, hash: &str) -> HashMap<String, DownloadSource> {
        let lookup = self.collaborators.resolver.sources_for_file(hash);
        match tokio::time::timeout(self.tuning.source_lookup_timeout, lookup).await {
            Ok(sources) => sources,
            Err(_) => {
                warn!("查询下载源超时: {}", hash);
                HashMap::new()
            }
        }
    }

    // ========================================================================
    // 3. 续传或拆分
    // ========================================================================

    async fn resume_or_split(&self) -> Result<()> {
        let max_per_file = self.max_per_file();
        let workers = self.state.lock().workers.clone();

        // 续传优先
        for worker in &workers {
            if worker.active_chunk_count() >= max_per_file {
                continue;
            }
            let Some(chunk) = worker.incomplete_inactive_chunks().first().copied() else {
                continue;
            };
            let Some(source) = self.unused_source(worker.as_ref()).await else {
                continue;
            };
            if self.start_chunk(worker, chunk, source) {
                debug!("续传分片 {}: 文件={}", chunk, worker.info().file_name());
                return Ok(());
            }
        }

        for worker in &workers {
            if worker.active_chunk_count() >= max_per_file {
                continue;
            }
            let Some(candidate) = worker
                .downloading_chunks()
                .into_iter()
                .find(|c| self.split_eligible(c))
            else {
                continue;
            };
            let Some(source) = self.unused_source(worker.as_ref()).await else {
                continue;
            };
            let Some(sibling) = worker.split_chunk(candidate.id) else {
                continue;
            };
            if self.start_chunk(worker, sibling.id, source) {
                info!(
                    "🔥 拆分分片: 文件={}, {} -> {} [{}-{}]",
                    worker.info().file_name(),
                    candidate.id,
                    sibling.id,
                    sibling.start,
                    sibling.end
                );
                return Ok(());
            }
        }
        Ok(())
    }

    fn split_eligible(&self, chunk: &DownloadChunk) -> bool {
        chunk.status == ChunkStatus::Downloading
            && chunk
                .started_at
                .map_or(false, |at| at.elapsed() >= self.tuning.min_split_interval)
            && chunk.percent() < f64::from(self.tuning.split_threshold_percent)
    }

    /// 该文件当前没有在用的下载源中最好的一个
    async fn unused_source(&self, worker: &dyn DownloadWorker) -> Option<DownloadSource> {
        let in_use = worker.active_sources();
        let candidates: Vec<DownloadSource> = self
            .lookup_sources(worker.info().hash())
            .await
            .into_values()
            .filter(|s| !in_use.contains(s))
            .collect();
        self.collaborators.oracle.best_source(&candidates)
    }

    /// 在调度锁内启动分片，工作器已被移除时放弃
    fn start_chunk(&self, worker: &Arc<dyn DownloadWorker>, chunk: ChunkId, source: DownloadSource) -> bool {
        let state = self.state.lock();
        if state.position_of(worker.info()).is_none() {
            return false;
        }
        if state.active_total() >= self.max_active() {
            return false;
        }
        worker.download_chunk(chunk, source, &self.executor)
    }

    // ========================================================================
    // 完成处理
    // ========================================================================

    fn remove_worker(&self, info: &Arc<DownloadInfo>) -> Option<Arc<dyn DownloadWorker>> {
        let removed = {
            let mut state = self.state.lock();
            state
                .position_of(info)
                .map(|index| state.workers.remove(index))
        };
        info.detach_worker();
        removed
    }

    /// 文件完成：结清剩余进度并从队列移除
    fn complete_file(&self, info: &Arc<DownloadInfo>) {
        if !info.mark_completed() {
            return;
        }
        let tracker = info.tracker();
        tracker.fold(tracker.remaining());
        info!("✓ 文件下载完成: {} ({} bytes)", info.file_name(), info.size());
        self.queue.complete(info.item());
        self.signal_completed();
    }

    fn signal_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// 完成的分片把下载源交给同文件的下一个未完成分片
    fn hand_off(&self, event: &ChunkEvent) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let state = self.state.lock();
        let Some(index) = state.position_of(&event.info) else {
            return;
        };
        let worker = &state.workers[index];
        if state.active_total() >= self.max_active()
            || worker.active_chunk_count() >= self.max_per_file()
            || worker.active_sources().contains(&event.source)
        {
            return;
        }
        if let Some(next) = worker.incomplete_inactive_chunks().first().copied() {
            if worker.download_chunk(next, event.source.clone(), &self.executor) {
                debug!(
                    "下载源 {} 转交给分片 {}: 文件={}",
                    event.source.peer,
                    next,
                    event.info.file_name()
                );
            }
        }
    }
}

impl ChunkEventSink for DispatcherInner {
    fn chunk_started(&self, event: &ChunkEvent) {
        self.collaborators.stats.download_started(&event.source.peer);
        for listener in &self.listeners {
            listener.chunk_started(event);
        }
        self.queue.notify_changed(event.info.item());
    }

    fn chunk_transfer(&self, event: &ChunkEvent, bytes: u64, interval: Duration) {
        self.collaborators
            .stats
            .received_bytes(&event.source.peer, bytes, interval);
        for listener in &self.listeners {
            listener.chunk_transfer(event, bytes, interval);
        }
    }

    fn chunk_ended(&self, event: &ChunkEvent) {
        self.collaborators.stats.download_complete(&event.source.peer);
        for listener in &self.listeners {
            listener.chunk_ended(event);
        }

        if event.chunk.is_complete() {
            self.hand_off(event);
        }

        let idle = {
            let mut state = self.state.lock();
            match state.position_of(&event.info) {
                Some(index) if state.workers[index].active_chunk_count() == 0 => {
                    Some(state.workers.remove(index))
                }
                _ => None,
            }
        };
        let Some(worker) = idle else {
            return;
        };

        worker.shutdown();
        event.info.detach_worker();
        if event.info.is_complete() {
            self.complete_file(&event.info);
        } else {
            debug!("工作器空闲，等待重新派发: {}", event.info.file_name());
            self.queue.notify_changed(event.info.item());
            self.wake.notify_one();
        }
    }

    fn chunk_queued(&self, event: &ChunkEvent) {
        self.collaborators.stats.peer_queued_us(&event.source.peer);
        for listener in &self.listeners {
            listener.chunk_queued(event);
        }
    }

    fn chunk_unqueued(&self, event: &ChunkEvent) {
        self.collaborators.stats.peer_unqueued_us(&event.source.peer);
        for listener in &self.listeners {
            listener.chunk_unqueued(event);
        }
    }
}

async fn create_empty_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("创建父目录失败")?;
    }
    tokio::fs::File::create(path)
        .await
        .context("创建文件失败")?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::collaborators::fakes::{ContentAsHash, FakeLookup, FakeResolver, RecordingStats};
    use crate::collaborators::RemoteEntry;
    use crate::common::ProgressTracker;
    use crate::config::QueueConfig;
    use crate::downloader::worker::fakes::{FakeFactory, FakeMode};
    use crate::queue::ItemId;
    use tempfile::TempDir;

    pub(crate) struct Harness {
        pub dir: TempDir,
        pub queue: Arc<DownloadQueue>,
        pub resolver: Arc<FakeResolver>,
        pub factory: Arc<FakeFactory>,
        pub verifier: Arc<ContentAsHash>,
        pub stats: Arc<RecordingStats>,
        pub aggregate: Arc<ProgressTracker>,
        pub dispatcher: DownloadDispatcher,
    }

    impl Harness {
        pub async fn new(max_active: usize, per_file: usize, mode: FakeMode, tuning: DispatcherTuning) -> Self {
            let dir = TempDir::new().unwrap();
            let aggregate = Arc::new(ProgressTracker::new());
            let lookup = Arc::new(FakeLookup::default());
            let queue = DownloadQueue::open(
                QueueConfig {
                    state_dir: dir.path().join("state"),
                    ..Default::default()
                },
                &dir.path().join("downloads"),
                lookup.clone(),
                aggregate.clone(),
            )
            .await
            .unwrap();

            let resolver = Arc::new(FakeResolver::default());
            let verifier = Arc::new(ContentAsHash::default());
            let stats = Arc::new(RecordingStats::default());
            let collaborators = Collaborators::new(resolver.clone(), lookup)
                .with_verifier(verifier.clone())
                .with_stats(stats.clone());
            let factory = Arc::new(FakeFactory::new(mode));
            let dispatcher = DownloadDispatcher::new(
                queue.clone(),
                collaborators,
                factory.clone(),
                Vec::new(),
                max_active,
                per_file,
                tuning,
            );

            Self {
                dir,
                queue,
                resolver,
                factory,
                verifier,
                stats,
                aggregate,
                dispatcher,
            }
        }

        pub fn target(&self) -> std::path::PathBuf {
            self.dir.path().join("downloads")
        }

        /// 提交文件并等待插入完成，返回文件节点
        pub async fn submit(&self, files: &[(&str, &str, u64)]) -> Vec<ItemId> {
            let entries = files
                .iter()
                .map(|(name, hash, size)| RemoteEntry::file(*name, *hash, *size, "peer"))
                .collect();
            self.queue
                .submit(self.target(), entries, true, None)
                .await
                .unwrap();
            self.queue.flush().await;
            let top = self.queue.top_dir_for(&self.target()).unwrap();
            self.queue.files_under(top)
        }

        pub fn source(&self, hash: &str, peer: &str) {
            self.resolver
                .add(hash, DownloadSource::new(peer, format!("http://{}/{}", peer, hash)));
        }
    }

    pub(crate) async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("条件未在超时前满足");
    }

    fn quick_split() -> DispatcherTuning {
        DispatcherTuning {
            min_split_interval: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_sources_until_new_peers() {
        let h = Harness::new(4, 2, FakeMode::Hold, DispatcherTuning::default()).await;
        let files = h.submit(&[("movie.mkv", "h1", 1_000_000)]).await;

        h.dispatcher.run_once().await;
        assert_eq!(h.factory.created_count(), 0);
        assert_eq!(h.queue.status_text(files[0]).unwrap(), "waiting for sources");

        // 有了对端但还没通知，分组仍被跳过
        h.source("h1", "alice");
        h.dispatcher.run_once().await;
        assert_eq!(h.factory.created_count(), 0);

        h.dispatcher.new_peers_present();
        h.dispatcher.run_once().await;
        assert_eq!(h.factory.created_count(), 1);
        assert_eq!(h.dispatcher.active_chunk_count(), 1);
        h.dispatcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_file_already_on_disk_completes_without_transfer() {
        let h = Harness::new(4, 2, FakeMode::Hold, DispatcherTuning::default()).await;
        std::fs::create_dir_all(h.target()).unwrap();
        std::fs::write(h.target().join("song.mp3"), b"abcdef").unwrap();
        let files = h.submit(&[("song.mp3", "abcdef", 6)]).await;
        h.source("abcdef", "alice");
        let before = h.aggregate.remaining();

        h.dispatcher.run_once().await;
        h.queue.flush().await;

        assert_eq!(h.factory.created_count(), 0);
        assert_eq!(h.resolver.lookups(), 0);
        assert_eq!(h.verifier.calls.load(Ordering::SeqCst), 1);
        assert!(!h.queue.contains(files[0]));
        assert_eq!(before - h.aggregate.remaining(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mismatched_local_file_is_downloaded() {
        let h = Harness::new(4, 2, FakeMode::Hold, DispatcherTuning::default()).await;
        std::fs::create_dir_all(h.target()).unwrap();
        std::fs::write(h.target().join("song.mp3"), b"xxxxxx").unwrap();
        h.submit(&[("song.mp3", "abcdef", 6)]).await;
        h.source("abcdef", "alice");

        h.dispatcher.run_once().await;
        assert_eq!(h.factory.created_count(), 1);
        h.dispatcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_slot_blocks_second_file() {
        let h = Harness::new(1, 1, FakeMode::Hold, DispatcherTuning::default()).await;
        let files = h.submit(&[("a", "ha", 1000), ("b", "hb", 1000)]).await;
        h.source("ha", "alice");
        h.source("hb", "bob");

        h.dispatcher.run_once().await;
        h.dispatcher.run_once().await;
        assert_eq!(h.factory.created_count(), 1);
        assert_eq!(h.dispatcher.active_chunk_count(), 1);

        // 第一个文件完成后释放槽位
        let first = h.factory.worker_for("a").unwrap();
        first.finish_all();
        wait_until(|| !h.queue.contains(files[0])).await;
        assert_eq!(h.dispatcher.worker_count(), 0);

        h.dispatcher.run_once().await;
        assert!(h.factory.worker_for("b").is_some());
        assert_eq!(h.dispatcher.active_chunk_count(), 1);
        h.dispatcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_killed_chunk_frees_slot() {
        let h = Harness::new(1, 1, FakeMode::Hold, DispatcherTuning::default()).await;
        h.submit(&[("a", "ha", 1000), ("b", "hb", 1000)]).await;
        h.source("ha", "alice");
        h.source("hb", "bob");

        h.dispatcher.run_once().await;
        let first = h.factory.worker_for("a").unwrap();
        assert!(first.kill_a_chunk());
        // 被结束的工作器空闲后移出，文件回到队列等待
        wait_until(|| !first.info().has_worker()).await;
        assert!(first.shut_down.load(Ordering::SeqCst));
        assert_eq!(h.dispatcher.worker_count(), 0);

        h.dispatcher.run_once().await;
        assert_eq!(h.factory.created_count(), 2);
        assert_eq!(h.dispatcher.active_chunk_count(), 1);
        h.dispatcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_split_after_interval_below_threshold() {
        let h = Harness::new(4, 4, FakeMode::Hold, quick_split()).await;
        h.submit(&[("big.iso", "hbig", 1_000_000)]).await;
        h.source("hbig", "alice");

        h.dispatcher.run_once().await;
        let worker = h.factory.worker_for("big.iso").unwrap();
        wait_until(|| worker.downloading_chunks().len() == 1).await;
        let chunk = worker.downloading_chunks()[0].clone();
        worker.info().record_received(chunk.id, chunk.lease, 400_000);

        // 第二个对端出现，但下载时间还不够
        h.source("hbig", "bob");
        h.dispatcher.run_once().await;
        assert_eq!(worker.info().chunk_count(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        h.dispatcher.run_once().await;
        assert_eq!(worker.info().chunk_count(), 2);
        assert_eq!(worker.active_chunk_count(), 2);

        let peers: Vec<String> = worker.active_sources().into_iter().map(|s| s.peer).collect();
        assert!(peers.contains(&"alice".to_string()));
        assert!(peers.contains(&"bob".to_string()));
        h.dispatcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_split_above_threshold() {
        let h = Harness::new(4, 4, FakeMode::Hold, quick_split()).await;
        h.submit(&[("big.iso", "hbig", 1_000_000)]).await;
        h.source("hbig", "alice");

        h.dispatcher.run_once().await;
        let worker = h.factory.worker_for("big.iso").unwrap();
        wait_until(|| worker.downloading_chunks().len() == 1).await;
        let chunk = worker.downloading_chunks()[0].clone();
        worker.info().record_received(chunk.id, chunk.lease, 600_000);

        h.source("hbig", "bob");
        tokio::time::sleep(Duration::from_millis(250)).await;
        h.dispatcher.run_once().await;
        assert_eq!(worker.info().chunk_count(), 1);
        h.dispatcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_split_without_unused_source() {
        let h = Harness::new(4, 4, FakeMode::Hold, quick_split()).await;
        h.submit(&[("big.iso", "hbig", 1_000_000)]).await;
        h.source("hbig", "alice");

        h.dispatcher.run_once().await;
        let worker = h.factory.worker_for("big.iso").unwrap();
        wait_until(|| worker.downloading_chunks().len() == 1).await;

        tokio::time::sleep(Duration::from_millis(250)).await;
        h.dispatcher.run_once().await;
        assert_eq!(worker.info().chunk_count(), 1);
        h.dispatcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_clip_enforces_limits() {
        let h = Harness::new(4, 4, FakeMode::Hold, quick_split()).await;
        h.submit(&[("big.iso", "hbig", 1_000_000)]).await;
        h.source("hbig", "alice");
        h.dispatcher.run_once().await;

        let worker = h.factory.worker_for("big.iso").unwrap();
        wait_until(|| worker.downloading_chunks().len() == 1).await;
        let chunk = worker.downloading_chunks()[0].clone();
        let sibling = worker.split_chunk(chunk.id).unwrap();
        assert!(worker.download_chunk(sibling.id, DownloadSource::new("bob", "http://bob/x"), &Handle::current()));
        assert_eq!(h.dispatcher.active_chunk_count(), 2);

        h.dispatcher.set_limits(4, 1);
        h.dispatcher.run_once().await;
        assert!(h.dispatcher.active_chunk_count() <= 1);
        assert!(worker.active_chunk_count() <= 1);
        h.dispatcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_completion_closes_file() {
        let h = Harness::new(4, 2, FakeMode::Instant, DispatcherTuning::default()).await;
        let files = h.submit(&[("a", "ha", 5000)]).await;
        h.source("ha", "alice");
        let before = h.aggregate.remaining();
        assert_eq!(before, 5000);

        h.dispatcher.run_once().await;
        wait_until(|| !h.queue.contains(files[0])).await;

        assert_eq!(h.dispatcher.worker_count(), 0);
        assert_eq!(h.aggregate.remaining(), 0);
        assert_eq!(h.stats.completed.lock().as_slice(), &["alice".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_zero_byte_file_created_without_chunks() {
        let h = Harness::new(4, 2, FakeMode::Hold, DispatcherTuning::default()).await;
        let files = h.submit(&[("empty.txt", "h0", 0)]).await;

        h.dispatcher.run_once().await;
        h.queue.flush().await;

        let path = h.target().join("empty.txt");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        assert_eq!(h.factory.created_count(), 0);
        assert_eq!(h.resolver.lookups(), 0);
        assert!(!h.queue.contains(files[0]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_requeue_keeps_info_for_resume() {
        let h = Harness::new(4, 2, FakeMode::Hold, DispatcherTuning::default()).await;
        let files = h.submit(&[("a", "ha", 1_000_000)]).await;
        h.source("ha", "alice");
        h.dispatcher.run_once().await;

        let worker = h.factory.worker_for("a").unwrap();
        wait_until(|| worker.downloading_chunks().len() == 1).await;
        let chunk = worker.downloading_chunks()[0].clone();
        worker.info().record_received(chunk.id, chunk.lease, 1000);

        h.dispatcher.requeue();
        assert_eq!(h.dispatcher.worker_count(), 0);
        assert!(worker.shut_down.load(Ordering::SeqCst));
        assert!(!worker.cancelled.load(Ordering::SeqCst));
        wait_until(|| worker.active_chunk_count() == 0 && worker.info().active_chunks().is_empty()).await;

        // 上一轮遍历已经返回过该文件，先走完这一轮
        h.dispatcher.run_once().await;
        h.dispatcher.run_once().await;
        assert_eq!(h.factory.created_count(), 2);
        let resumed = h.factory.worker_for("a").unwrap();
        assert!(Arc::ptr_eq(resumed.info(), worker.info()));
        assert_eq!(resumed.info().bytes_downloaded(), 1000);
        assert!(h.queue.download_info(files[0]).is_some());
        h.dispatcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loop_runs_and_stops() {
        let tuning = DispatcherTuning {
            dispatch_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let h = Harness::new(4, 2, FakeMode::Instant, tuning).await;
        let files = h.submit(&[("a", "ha", 100), ("b", "hb", 100)]).await;
        h.source("ha", "alice");
        h.source("hb", "bob");

        h.dispatcher.start();
        wait_until(|| !h.queue.contains(files[0]) && !h.queue.contains(files[1])).await;
        h.dispatcher.stop().await;
        assert_eq!(h.aggregate.remaining(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resume_inactive_chunk_before_split() {
        let h = Harness::new(4, 2, FakeMode::Hold, quick_split()).await;
        h.submit(&[("big.iso", "hbig", 1_000_000)]).await;
        h.source("hbig", "alice");
        h.source("hbig", "bob");

        h.dispatcher.run_once().await;
        let worker = h.factory.worker_for("big.iso").unwrap();
        wait_until(|| worker.downloading_chunks().len() == 1).await;
        let chunk = worker.downloading_chunks()[0].clone();
        let sibling = worker.split_chunk(chunk.id).unwrap();
        assert!(worker.download_chunk(sibling.id, DownloadSource::new("bob", "http://bob/hbig"), &Handle::current()));
        wait_until(|| worker.downloading_chunks().len() == 2).await;

        // 单文件上限降到 1，裁剪掉一个分片
        h.dispatcher.set_limits(4, 1);
        h.dispatcher.run_once().await;
        wait_until(|| worker.info().active_chunks().len() == 1).await;
        assert_eq!(worker.info().incomplete_inactive().len(), 1);

        // 剩下的分片已满足拆分条件，但续传优先
        tokio::time::sleep(Duration::from_millis(250)).await;
        h.dispatcher.set_limits(4, 2);
        h.dispatcher.run_once().await;

        assert_eq!(worker.info().chunk_count(), 2);
        assert!(worker.info().incomplete_inactive().is_empty());
        assert_eq!(worker.active_chunk_count(), 2);
        assert_eq!(h.factory.created_count(), 1);
        h.dispatcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_completed_chunk_hands_source_to_next_chunk() {
        let h = Harness::new(4, 2, FakeMode::Hold, DispatcherTuning::default()).await;
        h.submit(&[("big.iso", "hbig", 1_000_000)]).await;
        h.source("hbig", "alice");

        h.dispatcher.run_once().await;
        let worker = h.factory.worker_for("big.iso").unwrap();
        wait_until(|| worker.downloading_chunks().len() == 1).await;
        let chunk = worker.downloading_chunks()[0].clone();
        let sibling = worker.split_chunk(chunk.id).unwrap();
        let lookups = h.resolver.lookups();

        // 收完第一个分片后结束它
        let current = worker.info().chunk(chunk.id).unwrap();
        worker
            .info()
            .record_received(chunk.id, current.lease, current.remaining());
        assert!(worker.kill_a_chunk());

        wait_until(|| {
            worker
                .info()
                .chunk(sibling.id)
                .map_or(false, |c| c.is_active())
        })
        .await;
        let next = worker.info().chunk(sibling.id).unwrap();
        assert_eq!(next.source.unwrap().peer, "alice");
        assert!(worker.info().chunk(chunk.id).unwrap().is_complete());
        assert_eq!(h.dispatcher.worker_count(), 1);
        assert_eq!(h.factory.created_count(), 1);
        // 转交不重新查询下载源
        assert_eq!(h.resolver.lookups(), lookups);
        h.dispatcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_completion_skips_only_one_wait() {
        let tuning = DispatcherTuning {
            dispatch_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let h = Harness::new(4, 2, FakeMode::Hold, tuning).await;
        let files = h.submit(&[("empty.txt", "h0", 0)]).await;

        h.dispatcher.start();
        wait_until(|| !h.queue.contains(files[0])).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // 完成的那一轮之后立即再跑一轮，然后进入正常等待
        assert_eq!(h.dispatcher.iteration_count(), 2);
        h.dispatcher.stop().await;
    }

    /// 查询下载源时顺带取消该文件
    struct CancelOnLookup {
        queue: Arc<DownloadQueue>,
        target: ItemId,
    }

    #[async_trait::async_trait]
    impl crate::collaborators::SourceResolver for CancelOnLookup {
        async fn sources_for_file(&self, _hash: &str) -> HashMap<String, DownloadSource> {
            self.queue.cancel(self.target).await;
            let source = DownloadSource::new("alice", "http://alice/ha");
            HashMap::from([(source.peer.clone(), source)])
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_during_dispatch_starts_no_worker() {
        let h = Harness::new(4, 2, FakeMode::Hold, DispatcherTuning::default()).await;
        let files = h.submit(&[("a", "ha", 1_000_000)]).await;
        h.source("ha", "alice");
        h.dispatcher.run_once().await;

        // 重新排队后文件带着下载信息回到队列
        let worker = h.factory.worker_for("a").unwrap();
        h.dispatcher.requeue();
        wait_until(|| worker.info().active_chunks().is_empty()).await;

        let resolver = Arc::new(CancelOnLookup {
            queue: h.queue.clone(),
            target: files[0],
        });
        let dispatcher = DownloadDispatcher::new(
            h.queue.clone(),
            Collaborators::new(resolver, Arc::new(FakeLookup::default())),
            h.factory.clone(),
            Vec::new(),
            4,
            2,
            DispatcherTuning::default(),
        );
        dispatcher.run_once().await;
        dispatcher.run_once().await;

        assert!(!h.queue.contains(files[0]));
        assert_eq!(dispatcher.worker_count(), 0);
        assert_eq!(h.factory.created_count(), 1);
        assert!(!worker.info().has_worker());
        dispatcher.stop().await;
    }
}
