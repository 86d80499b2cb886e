//! 错误类型
//!
//! 稳态运行中的失败都在内部消化（记录日志 + 重试/降级），
//! 只有队列构造阶段的 I/O 故障会同步返回给调用方。

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// 下载队列错误
#[derive(Error, Debug)]
pub enum QueueError {
    /// 状态目录无法创建（启动期致命错误，调用方可选择直接退出）
    #[error("队列状态目录不可用: {path:?}: {source}")]
    StateDirUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("I/O 错误: {0}")]
    Io(#[from] io::Error),
    #[error("序列化错误: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("队列文件头无效")]
    BadMagic,
    #[error("不支持的队列文件版本: {0}")]
    UnsupportedVersion(u32),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;
