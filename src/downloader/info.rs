//! 单个文件的下载状态
//!
//! `DownloadInfo` 持有文件的全部分片，分片区间始终恰好铺满 `[0, size-1]`：
//! 只会拆分，不会合并。所有分片修改都在内部锁里完成，锁只在短临界区内持有。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::common::ProgressTracker;
use crate::downloader::chunk::{ChunkId, ChunkStatus, DownloadChunk};
use crate::downloader::worker::DownloadWorker;
use crate::downloader::DownloadSource;
use crate::persistence::PersistedChunk;
use crate::queue::ItemId;

/// `record_received` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// 租约已失效，调用方应停止传输
    Stale,
    /// 接受了 `accepted` 字节，分片未完成
    Continue { accepted: u64 },
    /// 接受了 `accepted` 字节，分片已完成
    Complete { accepted: u64 },
}

#[derive(Debug)]
struct InfoState {
    chunks: Vec<DownloadChunk>,
    next_id: u32,
    next_lease: u64,
    error_description: Option<String>,
}

impl InfoState {
    fn chunk_mut(&mut self, id: ChunkId) -> Option<&mut DownloadChunk> {
        self.chunks.iter_mut().find(|c| c.id == id)
    }

    /// 租约匹配的活动分片
    fn leased_mut(&mut self, id: ChunkId, lease: u64) -> Option<&mut DownloadChunk> {
        self.chunk_mut(id)
            .filter(|c| c.is_active() && c.lease == lease)
    }
}

/// 文件下载信息
pub struct DownloadInfo {
    item: ItemId,
    file_name: String,
    save_path: PathBuf,
    size: u64,
    hash: String,
    /// 文件级进度，父节点是整个队列的汇总跟踪器
    tracker: Arc<ProgressTracker>,
    state: Mutex<InfoState>,
    worker: Mutex<Option<Weak<dyn DownloadWorker>>>,
    completed: AtomicBool,
}

impl std::fmt::Debug for DownloadInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadInfo")
            .field("item", &self.item)
            .field("save_path", &self.save_path)
            .field("size", &self.size)
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

impl DownloadInfo {
    /// 新建下载信息，初始只有一个覆盖整个文件的分片
    ///
    /// 零字节文件不进入分片流程，调用方需提前处理
    pub fn new(
        item: ItemId,
        file_name: impl Into<String>,
        save_path: impl Into<PathBuf>,
        size: u64,
        hash: impl Into<String>,
        aggregate: &Arc<ProgressTracker>,
    ) -> Self {
        debug_assert!(size > 0, "零字节文件没有合法的字节区间");
        let chunks = vec![DownloadChunk::new(ChunkId(0), 0, size.saturating_sub(1))];
        Self::with_chunks(item, file_name.into(), save_path.into(), size, hash.into(), chunks, aggregate)
    }

    /// 从持久化的分片恢复
    ///
    /// 分片没有恰好铺满文件时丢弃断点信息，从头开始
    pub fn from_persisted(
        item: ItemId,
        file_name: impl Into<String>,
        save_path: impl Into<PathBuf>,
        size: u64,
        hash: impl Into<String>,
        persisted: &[PersistedChunk],
        aggregate: &Arc<ProgressTracker>,
    ) -> Self {
        let file_name = file_name.into();
        let chunks: Vec<DownloadChunk> = persisted
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let mut chunk = DownloadChunk::new(ChunkId(i as u32), c.start, c.end.max(c.start));
                chunk.position = c.position;
                chunk
            })
            .collect();

        if is_partition(&chunks, size) {
            Self::with_chunks(item, file_name, save_path.into(), size, hash.into(), chunks, aggregate)
        } else {
            warn!("文件 {} 的断点信息无效，从头下载", file_name);
            Self::new(item, file_name, save_path, size, hash, aggregate)
        }
    }

    fn with_chunks(
        item: ItemId,
        file_name: String,
        save_path: PathBuf,
        size: u64,
        hash: String,
        chunks: Vec<DownloadChunk>,
        aggregate: &Arc<ProgressTracker>,
    ) -> Self {
        let tracker = Arc::new(ProgressTracker::with_parent(aggregate.clone()));
        let downloaded: u64 = chunks.iter().map(|c| c.downloaded()).sum();
        tracker.set_expected_maximum(size - downloaded.min(size));

        Self {
            item,
            file_name,
            save_path,
            size,
            hash,
            tracker,
            state: Mutex::new(InfoState {
                next_id: chunks.len() as u32,
                chunks,
                next_lease: 1,
                error_description: None,
            }),
            worker: Mutex::new(None),
            completed: AtomicBool::new(false),
        }
    }

    pub fn item(&self) -> ItemId {
        self.item
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    /// 所有分片的快照（按起始位置排序）
    pub fn chunks(&self) -> Vec<DownloadChunk> {
        let mut chunks = self.state.lock().chunks.clone();
        chunks.sort_by_key(|c| c.start);
        chunks
    }

    pub fn chunk(&self, id: ChunkId) -> Option<DownloadChunk> {
        self.state.lock().chunks.iter().find(|c| c.id == id).cloned()
    }

    pub fn chunk_count(&self) -> usize {
        self.state.lock().chunks.len()
    }

    /// 启动一个分片：必须处于非活动且未完成状态，返回新的租约
    pub fn activate(&self, id: ChunkId, source: &DownloadSource) -> Option<u64> {
        let mut state = self.state.lock();
        let lease = state.next_lease;
        let chunk = state
            .chunk_mut(id)
            .filter(|c| !c.is_active() && !c.is_complete())?;

        let tracker = Arc::new(ProgressTracker::with_parent(self.tracker.clone()));
        tracker.set_expected_maximum(chunk.remaining());

        chunk.status = ChunkStatus::Connecting;
        chunk.source = Some(source.clone());
        chunk.secure = source.is_secure();
        chunk.started_at = None;
        chunk.lease = lease;
        chunk.tracker = Some(tracker);

        state.next_lease += 1;
        state.error_description = None;
        Some(lease)
    }

    /// 更新活动分片的状态，返回更新前的状态；租约失效时返回 None
    pub fn set_status(&self, id: ChunkId, lease: u64, status: ChunkStatus) -> Option<ChunkStatus> {
        let mut state = self.state.lock();
        let chunk = state.leased_mut(id, lease)?;
        let previous = chunk.status;
        chunk.status = status;
        if status == ChunkStatus::Downloading && chunk.started_at.is_none() {
            chunk.started_at = Some(Instant::now());
        }
        Some(previous)
    }

    /// 当前可写区间 `(position, end)`
    pub fn write_window(&self, id: ChunkId, lease: u64) -> Option<(u64, u64)> {
        let mut state = self.state.lock();
        state.leased_mut(id, lease).map(|c| (c.position, c.end))
    }

    /// 记录收到的字节，超出分片末尾的部分被截断
    pub fn record_received(&self, id: ChunkId, lease: u64, bytes: u64) -> Received {
        let (accepted, complete, tracker) = {
            let mut state = self.state.lock();
            let Some(chunk) = state.leased_mut(id, lease) else {
                return Received::Stale;
            };
            let accepted = bytes.min(chunk.remaining());
            chunk.position += accepted;
            (accepted, chunk.is_complete(), chunk.tracker.clone())
        };

        if let Some(tracker) = tracker {
            tracker.progress(accepted);
        }

        if complete {
            Received::Complete { accepted }
        } else {
            Received::Continue { accepted }
        }
    }

    /// 结束一个分片的执行单元，返回结束时的分片快照（包含最后的下载源）
    pub fn deactivate(&self, id: ChunkId, lease: u64) -> Option<DownloadChunk> {
        let mut state = self.state.lock();
        let chunk = state.leased_mut(id, lease)?;
        let snapshot = DownloadChunk {
            status: ChunkStatus::Inactive,
            ..chunk.clone()
        };

        chunk.status = ChunkStatus::Inactive;
        chunk.source = None;
        chunk.secure = false;
        chunk.started_at = None;
        chunk.tracker = None;
        Some(snapshot)
    }

    /// 拆分一个活动分片，新分片插入到原分片之后
    pub fn split(&self, id: ChunkId) -> Option<DownloadChunk> {
        let mut state = self.state.lock();
        let new_id = ChunkId(state.next_id);
        let index = state.chunks.iter().position(|c| c.id == id)?;
        let chunk = &mut state.chunks[index];
        if !chunk.is_active() || chunk.is_complete() {
            return None;
        }

        let sibling = chunk.split_off(new_id)?;
        debug!(
            "拆分分片: 文件={}, {} 保留 [{}-{}], 新分片 {} [{}-{}]",
            self.file_name, id, chunk.start, chunk.end, new_id, sibling.start, sibling.end
        );
        state.next_id += 1;
        state.chunks.insert(index + 1, sibling.clone());
        Some(sibling)
    }

    /// 未完成且没有执行单元的分片
    pub fn incomplete_inactive(&self) -> Vec<ChunkId> {
        let state = self.state.lock();
        let mut chunks: Vec<&DownloadChunk> = state
            .chunks
            .iter()
            .filter(|c| !c.is_active() && !c.is_complete())
            .collect();
        chunks.sort_by_key(|c| c.start);
        chunks.into_iter().map(|c| c.id).collect()
    }

    pub fn active_chunks(&self) -> Vec<DownloadChunk> {
        self.state
            .lock()
            .chunks
            .iter()
            .filter(|c| c.is_active())
            .cloned()
            .collect()
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.state.lock().chunks.iter().map(|c| c.downloaded()).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().chunks.iter().all(|c| c.is_complete())
    }

    /// 标记文件已完成，只有第一次调用返回 true
    pub fn mark_completed(&self) -> bool {
        !self.completed.swap(true, Ordering::SeqCst)
    }

    pub fn attach_worker(&self, worker: &Arc<dyn DownloadWorker>) {
        *self.worker.lock() = Some(Arc::downgrade(worker));
    }

    pub fn detach_worker(&self) {
        *self.worker.lock() = None;
    }

    pub fn worker(&self) -> Option<Arc<dyn DownloadWorker>> {
        self.worker.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn has_worker(&self) -> bool {
        self.worker().is_some()
    }

    pub fn set_error(&self, description: impl Into<String>) {
        self.state.lock().error_description = Some(description.into());
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error_description.clone()
    }

    /// 持久化用的分片区间
    pub fn persisted_chunks(&self) -> Vec<PersistedChunk> {
        self.chunks()
            .iter()
            .map(|c| PersistedChunk {
                start: c.start,
                end: c.end,
                position: c.position,
            })
            .collect()
    }
}

/// 分片（按起点排序后）是否恰好铺满 `[0, size-1]`
pub fn is_partition(chunks: &[DownloadChunk], size: u64) -> bool {
    if size == 0 || chunks.is_empty() {
        return false;
    }
    let mut ranges: Vec<(u64, u64, u64)> = chunks.iter().map(|c| (c.start, c.end, c.position)).collect();
    ranges.sort_unstable();

    let mut expected = 0u64;
    for (start, end, position) in ranges {
        if start != expected || end < start || position < start || position > end + 1 {
            return false;
        }
        expected = end + 1;
    }
    expected == size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::chunk::MIN_SPLIT_REMAINDER;
    use proptest::prelude::*;

    fn info(size: u64) -> (Arc<ProgressTracker>, DownloadInfo) {
        let aggregate = Arc::new(ProgressTracker::new());
        let info = DownloadInfo::new(ItemId(1), "a.bin", "/tmp/a.bin", size, "h", &aggregate);
        (aggregate, info)
    }

    fn source() -> DownloadSource {
        DownloadSource::new("peer", "http://peer/a.bin")
    }

    #[test]
    fn test_new_info_single_chunk() {
        let (_, info) = info(1_000_000);
        let chunks = info.chunks();
        assert_eq!(chunks.len(), 1);
        assert_eq!((chunks[0].start, chunks[0].end), (0, 999_999));
        assert!(is_partition(&chunks, 1_000_000));
        assert_eq!(info.incomplete_inactive(), vec![ChunkId(0)]);
    }

    #[test]
    fn test_activate_and_receive() {
        let (aggregate, info) = info(1000);
        let lease = info.activate(ChunkId(0), &source()).unwrap();
        // 重复启动失败
        assert!(info.activate(ChunkId(0), &source()).is_none());
        assert!(info.incomplete_inactive().is_empty());

        info.set_status(ChunkId(0), lease, ChunkStatus::Downloading);
        assert!(info.chunk(ChunkId(0)).unwrap().started_at.is_some());

        assert_eq!(
            info.record_received(ChunkId(0), lease, 600),
            Received::Continue { accepted: 600 }
        );
        // 超出末尾的部分被截断
        assert_eq!(
            info.record_received(ChunkId(0), lease, 600),
            Received::Complete { accepted: 400 }
        );
        assert!(info.is_complete());
        assert_eq!(info.bytes_downloaded(), 1000);
        assert_eq!(aggregate.completed(), 1000);
        assert_eq!(info.tracker().remaining(), 0);
    }

    #[test]
    fn test_stale_lease_rejected() {
        let (_, info) = info(1000);
        let old = info.activate(ChunkId(0), &source()).unwrap();
        info.deactivate(ChunkId(0), old).unwrap();
        let new = info.activate(ChunkId(0), &source()).unwrap();
        assert_ne!(old, new);

        assert_eq!(info.record_received(ChunkId(0), old, 10), Received::Stale);
        assert!(info.deactivate(ChunkId(0), old).is_none());
        assert!(info.write_window(ChunkId(0), old).is_none());
        assert_eq!(info.write_window(ChunkId(0), new), Some((0, 999)));
    }

    #[test]
    fn test_deactivate_returns_source() {
        let (_, info) = info(1000);
        let lease = info.activate(ChunkId(0), &source()).unwrap();
        info.record_received(ChunkId(0), lease, 100);

        let ended = info.deactivate(ChunkId(0), lease).unwrap();
        assert_eq!(ended.source.unwrap().peer, "peer");
        assert_eq!(ended.position, 100);

        let chunk = info.chunk(ChunkId(0)).unwrap();
        assert!(chunk.source.is_none());
        assert!(!chunk.is_active());
        // 下载过的字节保留
        assert_eq!(chunk.position, 100);
    }

    #[test]
    fn test_split_only_active() {
        let (_, info) = info(1_000_000);
        assert!(info.split(ChunkId(0)).is_none());

        let lease = info.activate(ChunkId(0), &source()).unwrap();
        info.record_received(ChunkId(0), lease, 400_000);
        let sibling = info.split(ChunkId(0)).unwrap();

        assert_eq!(sibling.id, ChunkId(1));
        assert_eq!(info.chunk_count(), 2);
        assert!(is_partition(&info.chunks(), 1_000_000));
        assert_eq!(info.incomplete_inactive(), vec![ChunkId(1)]);
        assert_eq!(info.bytes_downloaded(), 400_000);
    }

    #[test]
    fn test_from_persisted_resumes() {
        let aggregate = Arc::new(ProgressTracker::new());
        let persisted = vec![
            PersistedChunk { start: 0, end: 499, position: 500 },
            PersistedChunk { start: 500, end: 999, position: 700 },
        ];
        let info = DownloadInfo::from_persisted(ItemId(2), "b", "/tmp/b", 1000, "h", &persisted, &aggregate);

        assert_eq!(info.bytes_downloaded(), 700);
        assert_eq!(info.incomplete_inactive(), vec![ChunkId(1)]);
        assert_eq!(info.tracker().maximum(), 300);
    }

    #[test]
    fn test_from_persisted_rejects_gap() {
        let aggregate = Arc::new(ProgressTracker::new());
        let persisted = vec![
            PersistedChunk { start: 0, end: 399, position: 0 },
            PersistedChunk { start: 500, end: 999, position: 500 },
        ];
        let info = DownloadInfo::from_persisted(ItemId(2), "b", "/tmp/b", 1000, "h", &persisted, &aggregate);
        assert_eq!(info.chunk_count(), 1);
        assert_eq!(info.bytes_downloaded(), 0);
    }

    #[test]
    fn test_mark_completed_once() {
        let (_, info) = info(10);
        assert!(info.mark_completed());
        assert!(!info.mark_completed());
    }

    #[derive(Debug, Clone)]
    enum Step {
        Receive(usize, u64),
        Split(usize),
        Restart(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0usize..16, 0u64..400_000).prop_map(|(i, n)| Step::Receive(i, n)),
            (0usize..16).prop_map(Step::Split),
            (0usize..16).prop_map(Step::Restart),
        ]
    }

    proptest! {
        #[test]
        fn prop_chunks_always_partition_file(
            size in 1u64..4_000_000,
            steps in prop::collection::vec(step(), 1..60),
        ) {
            let (_, info) = info(size);
            let mut received = 0u64;

            for step in steps {
                let chunks = info.chunks();
                let pick = |i: usize| chunks[i % chunks.len()].clone();
                match step {
                    Step::Receive(i, n) => {
                        let chunk = pick(i);
                        let lease = if chunk.is_active() {
                            chunk.lease
                        } else {
                            match info.activate(chunk.id, &source()) {
                                Some(lease) => lease,
                                None => continue,
                            }
                        };
                        match info.record_received(chunk.id, lease, n) {
                            Received::Continue { accepted } | Received::Complete { accepted } => {
                                received += accepted;
                            }
                            Received::Stale => {}
                        }
                    }
                    Step::Split(i) => {
                        let chunk = pick(i);
                        if chunk.is_active() {
                            let before = chunk.remaining();
                            match info.split(chunk.id) {
                                Some(sibling) => prop_assert!(sibling.len() >= MIN_SPLIT_REMAINDER),
                                None => prop_assert!(before < 2 * MIN_SPLIT_REMAINDER || chunk.is_complete()),
                            }
                        }
                    }
                    Step::Restart(i) => {
                        let chunk = pick(i);
                        if chunk.is_active() {
                            info.deactivate(chunk.id, chunk.lease);
                        }
                    }
                }

                prop_assert!(is_partition(&info.chunks(), size));
                prop_assert_eq!(info.bytes_downloaded(), received);
            }
        }
    }
}
