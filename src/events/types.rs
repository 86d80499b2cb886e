//! 事件类型定义

use serde::{Deserialize, Serialize};

use crate::downloader::ChunkId;
use crate::queue::ItemId;

/// 下载队列树变更事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "item_id", rename_all = "snake_case")]
pub enum QueueEvent {
    /// 新节点插入
    Inserted(ItemId),
    /// 节点移除（完成、取消或目录被清理）
    Removed(ItemId),
    /// 节点显示状态变化（无下载源、错误、进度等）
    Changed(ItemId),
}

impl QueueEvent {
    pub fn item_id(&self) -> ItemId {
        match self {
            QueueEvent::Inserted(id) | QueueEvent::Removed(id) | QueueEvent::Changed(id) => *id,
        }
    }
}

/// 活动分片表的行键：(文件节点, 分片)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowKey {
    pub item: ItemId,
    pub chunk: ChunkId,
}

/// 活动分片表事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "row", rename_all = "snake_case")]
pub enum TableEvent {
    Inserted(RowKey),
    Updated(RowKey),
    Removed(RowKey),
}

impl TableEvent {
    pub fn key(&self) -> RowKey {
        match self {
            TableEvent::Inserted(key) | TableEvent::Updated(key) | TableEvent::Removed(key) => *key,
        }
    }
}
