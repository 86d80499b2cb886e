use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{QueueError, QueueResult};

/// 文件魔数
const MAGIC: &[u8; 4] = b"PSDQ";

/// 当前队列文件版本
pub const QUEUE_FILE_VERSION: u32 = 1;

/// 持久化的整个队列
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedQueue {
    pub version: u32,
    /// 保存时间（Unix 时间戳，秒）
    pub saved_at: i64,
    /// 根节点下的顶层目录
    pub items: Vec<PersistedItem>,
}

impl PersistedQueue {
    pub fn new(items: Vec<PersistedItem>) -> Self {
        Self {
            version: QUEUE_FILE_VERSION,
            saved_at: chrono::Utc::now().timestamp(),
            items,
        }
    }
}

/// 持久化的队列节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistedItem {
    Directory {
        name: String,
        path: PathBuf,
        children: Vec<PersistedItem>,
    },
    File {
        name: String,
        hash: String,
        size: u64,
        dispatch_id: u64,
        /// 已开始下载的文件才有分片信息
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunks: Option<Vec<PersistedChunk>>,
    },
}

/// 持久化的分片区间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedChunk {
    pub start: u64,
    pub end: u64,
    pub position: u64,
}

// ============================================================================
// 写入
// ============================================================================

/// 保存队列
///
/// 先写入 `.tmp` 临时文件再原子重命名，失败时旧文件保持不变
///
/// # Arguments
/// * `path` - 队列文件路径
/// * `queue` - 队列快照
pub fn save_queue(path: &Path, queue: &PersistedQueue) -> QueueResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp_path = temp_path_for(path);
    let result = write_to(&temp_path, queue);
    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    fs::rename(&temp_path, path)?;
    debug!("已保存下载队列: {:?}", path);
    Ok(())
}

fn write_to(temp_path: &Path, queue: &PersistedQueue) -> QueueResult<()> {
    let mut writer = BufWriter::new(File::create(temp_path)?);
    writer.write_all(MAGIC)?;
    writer.write_all(&QUEUE_FILE_VERSION.to_le_bytes())?;

    let mut encoder = GzEncoder::new(writer, Compression::default());
    serde_json::to_writer(&mut encoder, queue)?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

// ============================================================================
// 读取
// ============================================================================

/// 加载队列
///
/// # Returns
/// - `Ok(Some(queue))` - 加载成功
/// - `Ok(None)` - 文件不存在
/// - `Err` - 文件损坏或版本不符
pub fn load_queue(path: &Path) -> QueueResult<Option<PersistedQueue>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut reader = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).map_err(|_| QueueError::BadMagic)?;
    if &magic != MAGIC {
        return Err(QueueError::BadMagic);
    }

    let mut version = [0u8; 4];
    reader.read_exact(&mut version)?;
    let version = u32::from_le_bytes(version);
    if version != QUEUE_FILE_VERSION {
        return Err(QueueError::UnsupportedVersion(version));
    }

    let queue: PersistedQueue = serde_json::from_reader(GzDecoder::new(reader))?;
    debug!("已加载下载队列: {:?} ({} 个顶层目录)", path, queue.items.len());
    Ok(Some(queue))
}
