// Peer Share Rust Library
// P2P 下载协调核心库

// 配置管理模块
pub mod config;

// 日志初始化
pub mod logging;

// 错误类型
pub mod error;

// 公共模块（进度跟踪）
pub mod common;

// 队列与活动分片事件
pub mod events;

// 外部协作者接口（下载源解析、远程目录展开、校验）
pub mod collaborators;

// 下载队列树
pub mod queue;

// 队列持久化
pub mod persistence;

// 下载引擎模块
pub mod downloader;

// 导出常用类型
pub use collaborators::{Collaborators, RemoteEntry};
pub use common::ProgressTracker;
pub use config::AppConfig;
pub use downloader::{
    DownloadController, DownloadDispatcher, DownloadInfo, DownloadSource, DownloadWorker,
    WorkerFactory,
};
pub use error::{QueueError, QueueResult};
pub use events::{QueueEvent, RowKey, TableEvent};
pub use queue::{DownloadQueue, ItemId, SubmitListener};
