//! 下载模块
//!
//! - `chunk` / `info`: 分片和单个文件的下载状态
//! - `worker` / `http_worker`: 工作器接口与 HTTP 区间请求实现
//! - `dispatcher`: 槽位调度、分片拆分、完成处理
//! - `controller`: 对外门面，负责启动和关闭顺序

pub mod bandwidth;
pub mod chunk;
pub mod controller;
pub mod dispatcher;
pub mod http_worker;
pub mod info;
pub mod source;
pub mod worker;

pub use bandwidth::BandwidthLimiter;
pub use chunk::{ChunkId, ChunkStatus, DownloadChunk, MIN_SPLIT_REMAINDER};
pub use controller::{ActiveChunkTable, ChunkRow, DownloadController};
pub use dispatcher::{DispatcherTuning, DownloadDispatcher};
pub use http_worker::{HttpDownloadWorker, HttpWorkerFactory};
pub use info::{is_partition, DownloadInfo, Received};
pub use source::DownloadSource;
pub use worker::{ChunkEvent, ChunkEventSink, ChunkUnit, DownloadWorker, WorkerCore, WorkerFactory};
