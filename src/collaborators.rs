//! 外部协作者接口
//!
//! 索引节点查询、对端统计、内容校验都不属于下载核心，这里只定义契约。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::downloader::DownloadSource;

/// 索引节点返回的远程条目（文件或目录）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    /// 内容哈希，目录为空串
    pub hash: String,
    pub size: u64,
    pub is_directory: bool,
    /// 提供该条目的对端
    pub peer: String,
}

impl RemoteEntry {
    pub fn file(name: impl Into<String>, hash: impl Into<String>, size: u64, peer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash: hash.into(),
            size,
            is_directory: false,
            peer: peer.into(),
        }
    }

    pub fn directory(name: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash: String::new(),
            size: 0,
            is_directory: true,
            peer: peer.into(),
        }
    }
}

/// 下载源查询：内容哈希 -> 对端 -> 下载源，可能为空
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn sources_for_file(&self, hash: &str) -> HashMap<String, DownloadSource>;
}

/// 按历史表现挑选最佳下载源
pub trait BestSourceOracle: Send + Sync {
    fn best_source(&self, candidates: &[DownloadSource]) -> Option<DownloadSource>;
}

/// 远程目录展开
#[async_trait]
pub trait ChildrenLookup: Send + Sync {
    async fn children(&self, entry: &RemoteEntry) -> Result<Vec<RemoteEntry>>;
}

/// 对端统计
pub trait PeerStatsSink: Send + Sync {
    fn download_started(&self, _peer: &str) {}
    fn download_complete(&self, _peer: &str) {}
    fn received_bytes(&self, _peer: &str, _count: u64, _interval: Duration) {}
    fn peer_queued_us(&self, _peer: &str) {}
    fn peer_unqueued_us(&self, _peer: &str) {}
}

/// 内容校验：计算本地文件的内容哈希
#[async_trait]
pub trait ContentVerifier: Send + Sync {
    async fn digest(&self, path: &Path) -> Result<String>;
}

/// 默认校验器：十六进制 SHA-256
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Verifier;

#[async_trait]
impl ContentVerifier for Sha256Verifier {
    async fn digest(&self, path: &Path) -> Result<String> {
        let path: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<String> {
            let mut file = std::fs::File::open(&path)
                .with_context(|| format!("打开文件失败: {:?}", path))?;
            let mut hasher = Sha256::new();
            std::io::copy(&mut file, &mut hasher)
                .with_context(|| format!("读取文件失败: {:?}", path))?;
            Ok(hex::encode(hasher.finalize()))
        })
        .await
        .context("计算哈希的任务异常退出")?
    }
}

/// 没有历史数据时使用：按对端名排序取第一个
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstSourceOracle;

impl BestSourceOracle for FirstSourceOracle {
    fn best_source(&self, candidates: &[DownloadSource]) -> Option<DownloadSource> {
        candidates.iter().min_by(|a, b| a.peer.cmp(&b.peer)).cloned()
    }
}

/// 丢弃所有统计
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPeerStats;

impl PeerStatsSink for NoopPeerStats {}

/// 调度器依赖的协作者集合
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn SourceResolver>,
    pub oracle: Arc<dyn BestSourceOracle>,
    pub lookup: Arc<dyn ChildrenLookup>,
    pub stats: Arc<dyn PeerStatsSink>,
    pub verifier: Arc<dyn ContentVerifier>,
}

impl Collaborators {
    /// 只提供必需的查询接口，其余使用默认实现
    pub fn new(resolver: Arc<dyn SourceResolver>, lookup: Arc<dyn ChildrenLookup>) -> Self {
        Self {
            resolver,
            oracle: Arc::new(FirstSourceOracle),
            lookup,
            stats: Arc::new(NoopPeerStats),
            verifier: Arc::new(Sha256Verifier),
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn BestSourceOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn PeerStatsSink>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn ContentVerifier>) -> Self {
        self.verifier = verifier;
        self
    }
}

/// 测试用的可控协作者
#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 下载源表可随时修改
    #[derive(Default)]
    pub struct FakeResolver {
        sources: Mutex<HashMap<String, Vec<DownloadSource>>>,
        pub lookups: AtomicUsize,
    }

    impl FakeResolver {
        pub fn add(&self, hash: &str, source: DownloadSource) {
            self.sources
                .lock()
                .entry(hash.to_string())
                .or_default()
                .push(source);
        }

        pub fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SourceResolver for FakeResolver {
        async fn sources_for_file(&self, hash: &str) -> HashMap<String, DownloadSource> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.sources
                .lock()
                .get(hash)
                .map(|list| {
                    list.iter()
                        .map(|s| (s.peer.clone(), s.clone()))
                        .collect()
                })
                .unwrap_or_default()
        }
    }

    /// 目录展开表：目录名 -> 子条目
    #[derive(Default)]
    pub struct FakeLookup {
        pub children: Mutex<HashMap<String, Vec<RemoteEntry>>>,
    }

    impl FakeLookup {
        pub fn insert(&self, dir: &str, children: Vec<RemoteEntry>) {
            self.children.lock().insert(dir.to_string(), children);
        }
    }

    #[async_trait]
    impl ChildrenLookup for FakeLookup {
        async fn children(&self, entry: &RemoteEntry) -> Result<Vec<RemoteEntry>> {
            self.children
                .lock()
                .get(&entry.name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("未知目录: {}", entry.name))
        }
    }

    /// 以文件内容本身作为"哈希"的校验器
    #[derive(Default)]
    pub struct ContentAsHash {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl ContentVerifier for ContentAsHash {
        async fn digest(&self, path: &Path) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let bytes = tokio::fs::read(path).await?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }

    #[derive(Default)]
    pub struct RecordingStats {
        pub started: Mutex<Vec<String>>,
        pub completed: Mutex<Vec<String>>,
    }

    impl PeerStatsSink for RecordingStats {
        fn download_started(&self, peer: &str) {
            self.started.lock().push(peer.to_string());
        }
        fn download_complete(&self, peer: &str) {
            self.completed.lock().push(peer.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sha256_verifier() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"hello")
            .unwrap();

        let digest = Sha256Verifier.digest(&path).await.unwrap();
        assert_eq!(
            digest,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn test_sha256_verifier_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(Sha256Verifier.digest(&dir.path().join("nope")).await.is_err());
    }

    #[test]
    fn test_first_source_oracle() {
        let candidates = vec![
            DownloadSource::new("peer-b", "http://b/file"),
            DownloadSource::new("peer-a", "http://a/file"),
        ];
        assert_eq!(
            FirstSourceOracle.best_source(&candidates).unwrap().peer,
            "peer-a"
        );
        assert!(FirstSourceOracle.best_source(&[]).is_none());
    }
}
