//! 分片
//!
//! 文件内的一段字节区间及其传输状态，拆分规则也在这里

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::common::ProgressTracker;
use crate::downloader::DownloadSource;

/// 拆分后每一半至少保留的字节数
pub const MIN_SPLIT_REMAINDER: u64 = 64 * 1024;

/// 分片编号，在所属文件内唯一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub u32);

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// 没有执行单元持有
    Inactive,
    /// 正在预分配本地文件
    Allocating,
    /// 正在连接对端
    Connecting,
    /// 对端让我们排队
    Queued,
    /// 正在接收数据
    Downloading,
}

impl ChunkStatus {
    pub fn is_active(self) -> bool {
        self != ChunkStatus::Inactive
    }
}

/// 文件内一段连续字节区间 `[start, end]`
///
/// `position` 是下一个未接收的字节，`position > end` 表示完成
#[derive(Debug, Clone)]
pub struct DownloadChunk {
    pub id: ChunkId,
    pub start: u64,
    pub end: u64,
    pub position: u64,
    pub status: ChunkStatus,
    /// 当前下载源（仅活动时有值）
    pub source: Option<DownloadSource>,
    /// 当前传输是否加密
    pub secure: bool,
    /// 进入 Downloading 的时刻
    pub started_at: Option<Instant>,
    /// 每次启动递增，旧的执行单元凭旧租约无法再推进该分片
    pub lease: u64,
    pub tracker: Option<Arc<ProgressTracker>>,
}

impl DownloadChunk {
    pub fn new(id: ChunkId, start: u64, end: u64) -> Self {
        debug_assert!(end >= start);
        Self {
            id,
            start,
            end,
            position: start,
            status: ChunkStatus::Inactive,
            source: None,
            secure: false,
            started_at: None,
            lease: 0,
            tracker: None,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// 已下载字节数
    pub fn downloaded(&self) -> u64 {
        self.position - self.start
    }

    /// 剩余字节数
    pub fn remaining(&self) -> u64 {
        (self.end + 1).saturating_sub(self.position)
    }

    pub fn is_complete(&self) -> bool {
        self.position > self.end
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// 完成百分比 (0-100)
    pub fn percent(&self) -> f64 {
        self.downloaded() as f64 / self.len() as f64 * 100.0
    }

    /// 把未下载的后半段拆成新分片
    ///
    /// 当前分片保留已下载部分加上剩余部分的前一半，新分片覆盖后一半。
    /// 剩余量不足 `2 * MIN_SPLIT_REMAINDER` 时不拆分。
    pub fn split_off(&mut self, new_id: ChunkId) -> Option<DownloadChunk> {
        let remaining = self.remaining();
        if remaining < 2 * MIN_SPLIT_REMAINDER {
            return None;
        }

        let mid = self.position + remaining / 2;
        let sibling = DownloadChunk::new(new_id, mid, self.end);
        self.end = mid - 1;

        if let Some(tracker) = &self.tracker {
            tracker.set_expected_maximum(tracker.completed() + self.remaining());
        }
        Some(sibling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_creation() {
        let chunk = DownloadChunk::new(ChunkId(0), 0, 1023);
        assert_eq!(chunk.len(), 1024);
        assert_eq!(chunk.remaining(), 1024);
        assert_eq!(chunk.downloaded(), 0);
        assert!(!chunk.is_complete());
        assert!(!chunk.is_active());
    }

    #[test]
    fn test_chunk_complete() {
        let mut chunk = DownloadChunk::new(ChunkId(0), 100, 199);
        chunk.position = 200;
        assert!(chunk.is_complete());
        assert_eq!(chunk.remaining(), 0);
        assert_eq!(chunk.percent(), 100.0);
    }

    #[test]
    fn test_split_keeps_downloaded_prefix() {
        let mut chunk = DownloadChunk::new(ChunkId(0), 0, 999_999);
        chunk.position = 400_000;

        let sibling = chunk.split_off(ChunkId(1)).unwrap();

        // 剩余 600000，对半分
        assert_eq!(chunk.end, 699_999);
        assert_eq!(sibling.start, 700_000);
        assert_eq!(sibling.end, 999_999);
        assert_eq!(sibling.position, sibling.start);
        assert_eq!(sibling.status, ChunkStatus::Inactive);
        // 已下载字节只计在原分片上
        assert_eq!(chunk.downloaded() + sibling.downloaded(), 400_000);
        assert_eq!(chunk.len() + sibling.len(), 1_000_000);
    }

    #[test]
    fn test_split_refuses_small_remainder() {
        let mut chunk = DownloadChunk::new(ChunkId(0), 0, 2 * MIN_SPLIT_REMAINDER - 2);
        assert!(chunk.split_off(ChunkId(1)).is_none());
        assert_eq!(chunk.end, 2 * MIN_SPLIT_REMAINDER - 2);

        let mut chunk = DownloadChunk::new(ChunkId(0), 0, 2 * MIN_SPLIT_REMAINDER - 1);
        assert!(chunk.split_off(ChunkId(1)).is_some());
    }

    #[test]
    fn test_split_adjusts_tracker() {
        let tracker = Arc::new(ProgressTracker::new());
        let mut chunk = DownloadChunk::new(ChunkId(0), 0, 1_048_575);
        tracker.set_expected_maximum(chunk.remaining());
        tracker.progress(48_576);
        chunk.position = 48_576;
        chunk.tracker = Some(tracker.clone());

        chunk.split_off(ChunkId(1)).unwrap();
        assert_eq!(tracker.remaining(), chunk.remaining());
    }
}
