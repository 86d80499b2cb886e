//! 下载队列持久化
//!
//! 整棵队列树保存为一个带版本号的压缩文件，启动时整体加载。
//!
//! ## 文件结构
//!
//! ```text
//! {state_dir}/
//! ├── download_queue.bin      # 魔数 + 版本号 + gzip(JSON)
//! └── download_queue.bin.tmp  # 保存过程中的临时文件
//! ```
//!
//! 只保存纯数据（目录、文件、哈希、大小、分组号、分片区间），
//! 锁、工作器引用、进度跟踪器等运行时字段在加载后重新构建。

pub mod queue_file;

pub use queue_file::{
    load_queue, save_queue, PersistedChunk, PersistedItem, PersistedQueue, QUEUE_FILE_VERSION,
};
