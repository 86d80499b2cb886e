//! HTTP 分片下载工作器
//!
//! 每个活动分片一个任务：Range 请求 `bytes=<position>-<end>`，流式写入文件对应偏移。
//! 对端返回 503/429 表示让我们排队，等待 Retry-After（或配置的默认间隔）后重试。

use std::io::SeekFrom;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use reqwest::header::{RANGE, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::config::DownloadConfig;
use crate::downloader::bandwidth::BandwidthLimiter;
use crate::downloader::chunk::{ChunkId, ChunkStatus, DownloadChunk};
use crate::downloader::info::{DownloadInfo, Received};
use crate::downloader::worker::{ChunkEventSink, ChunkUnit, DownloadWorker, WorkerCore, WorkerFactory};
use crate::downloader::DownloadSource;
use crate::events::EventThrottler;

/// 每累积 256KB 上报一次传输进度
const PROGRESS_UPDATE_THRESHOLD: u64 = 256 * 1024;

/// 工作器共用的传输参数
#[derive(Debug, Clone)]
struct TransferSettings {
    queued_retry: Duration,
    read_timeout: Duration,
}

/// 一次响应读取的结果
enum BodyOutcome {
    /// 分片完成或租约失效，执行单元应退出
    Done,
    /// 连接提前结束，携带本次收到的字节数，需要重新请求
    Truncated(u64),
}

pub struct HttpDownloadWorker {
    core: WorkerCore,
    client: Client,
    limiter: Arc<BandwidthLimiter>,
    settings: TransferSettings,
    /// 文件只预分配一次
    prepared: OnceCell<()>,
    me: Weak<HttpDownloadWorker>,
}

impl HttpDownloadWorker {
    async fn run(self: Arc<Self>, unit: ChunkUnit) {
        let info = self.core.info().clone();
        debug!(
            "启动分片 {}: 文件={}, 对端={}",
            unit.chunk,
            info.file_name(),
            unit.source.peer
        );
        self.core.emit_current(&unit, |sink, event| sink.chunk_started(event));

        let result = tokio::select! {
            result = self.transfer(&unit) => result,
            _ = unit.token.cancelled() => Ok(()),
        };
        if let Err(e) = result {
            warn!(
                "分片 {} 传输失败: 文件={}, 对端={}: {:#}",
                unit.chunk,
                info.file_name(),
                unit.source.peer,
                e
            );
            info.set_error(format!("{:#}", e));
        }

        let remaining = self.core.finish(&unit);
        if remaining == 0 && self.core.is_cancelled() {
            discard_partial(info.save_path()).await;
        }
    }

    async fn transfer(&self, unit: &ChunkUnit) -> Result<()> {
        let info = self.core.info().clone();

        if self.prepared.get().is_none() {
            info.set_status(unit.chunk, unit.lease, ChunkStatus::Allocating);
            self.prepared
                .get_or_try_init(|| prepare_file(info.save_path(), info.size()))
                .await?;
        }

        let mut queued = false;
        loop {
            let Some((position, end)) = info.write_window(unit.chunk, unit.lease) else {
                return Ok(());
            };
            if position > end {
                return Ok(());
            }
            if info.set_status(unit.chunk, unit.lease, ChunkStatus::Connecting).is_none() {
                return Ok(());
            }

            let response = self
                .client
                .get(&unit.source.location)
                .header(RANGE, format!("bytes={}-{}", position, end))
                .send()
                .await
                .context("发送HTTP请求失败")?;

            let status = response.status();
            if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::TOO_MANY_REQUESTS {
                let wait = retry_after(&response).unwrap_or(self.settings.queued_retry);
                if info.set_status(unit.chunk, unit.lease, ChunkStatus::Queued).is_none() {
                    return Ok(());
                }
                if !queued {
                    queued = true;
                    self.core.emit_current(unit, |sink, event| sink.chunk_queued(event));
                }
                debug!("对端 {} 让分片 {} 排队 {:?}", unit.source.peer, unit.chunk, wait);
                tokio::time::sleep(wait).await;
                continue;
            }
            if !status.is_success() {
                bail!("HTTP错误: {}", status);
            }
            if status != StatusCode::PARTIAL_CONTENT && position != 0 {
                bail!("对端不支持 Range 请求: {}", status);
            }

            match self.receive(unit, response, position, &mut queued).await? {
                BodyOutcome::Done => return Ok(()),
                BodyOutcome::Truncated(0) => bail!("连接提前关闭"),
                BodyOutcome::Truncated(received) => {
                    debug!("分片 {} 连接提前结束，已收到 {} bytes，重新请求", unit.chunk, received);
                }
            }
        }
    }

    async fn receive(
        &self,
        unit: &ChunkUnit,
        response: Response,
        position: u64,
        queued: &mut bool,
    ) -> Result<BodyOutcome> {
        let info = self.core.info().clone();
        let mut file = OpenOptions::new()
            .write(true)
            .open(info.save_path())
            .await
            .context("打开输出文件失败")?;
        file.seek(SeekFrom::Start(position))
            .await
            .context("文件定位失败")?;

        let mut stream = response.bytes_stream();
        let throttler = EventThrottler::default();
        let mut started = false;
        let mut received = 0u64;
        let mut pending = 0u64;
        let mut last_report = Instant::now();

        let outcome = loop {
            let next = tokio::time::timeout(self.settings.read_timeout, stream.next())
                .await
                .context("读取数据超时")?;
            let Some(piece) = next else {
                break BodyOutcome::Truncated(received);
            };
            let piece = piece.context("读取数据流失败")?;
            if piece.is_empty() {
                continue;
            }

            if !started {
                started = true;
                if info.set_status(unit.chunk, unit.lease, ChunkStatus::Downloading).is_none() {
                    break BodyOutcome::Done;
                }
                if std::mem::take(queued) {
                    self.core.emit_current(unit, |sink, event| sink.chunk_unqueued(event));
                }
            }

            self.limiter.acquire(piece.len()).await;

            // 分片可能已被拆分，只写到当前末尾
            let Some((window_start, end)) = info.write_window(unit.chunk, unit.lease) else {
                break BodyOutcome::Done;
            };
            let take = (end + 1 - window_start).min(piece.len() as u64) as usize;
            file.write_all(&piece[..take])
                .await
                .context("写入文件失败")?;

            match info.record_received(unit.chunk, unit.lease, take as u64) {
                Received::Stale => break BodyOutcome::Done,
                Received::Continue { accepted } => {
                    received += accepted;
                    pending += accepted;
                }
                Received::Complete { accepted } => {
                    pending += accepted;
                    break BodyOutcome::Done;
                }
            }

            if pending >= PROGRESS_UPDATE_THRESHOLD || throttler.should_emit() {
                self.report(unit, pending, last_report.elapsed());
                pending = 0;
                last_report = Instant::now();
            }
        };

        file.flush().await.context("刷新文件缓冲失败")?;
        if pending > 0 {
            self.report(unit, pending, last_report.elapsed());
        }
        Ok(outcome)
    }

    fn report(&self, unit: &ChunkUnit, bytes: u64, interval: Duration) {
        self.core
            .emit_current(unit, |sink, event| sink.chunk_transfer(event, bytes, interval));
    }
}

impl DownloadWorker for HttpDownloadWorker {
    fn info(&self) -> &Arc<DownloadInfo> {
        self.core.info()
    }

    fn download_chunk(&self, chunk: ChunkId, source: DownloadSource, executor: &Handle) -> bool {
        let Some(me) = self.me.upgrade() else {
            return false;
        };
        let Some(unit) = self.core.begin(chunk, source) else {
            return false;
        };
        executor.spawn(me.run(unit));
        true
    }

    fn split_chunk(&self, chunk: ChunkId) -> Option<DownloadChunk> {
        self.core.info().split(chunk)
    }

    fn active_chunk_count(&self) -> usize {
        self.core.active_count()
    }

    fn kill_a_chunk(&self) -> bool {
        self.core.kill_one()
    }

    fn cancel(&self) {
        self.core.stop(true);
        // 没有仍在运行的任务时直接清理，否则由最后退出的任务清理
        if self.core.running_count() == 0 {
            let path = self.core.info().save_path();
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("删除未完成文件失败: {:?}: {}", path, e);
                }
            }
        }
    }

    fn shutdown(&self) {
        self.core.stop(false);
    }
}

/// 默认工作器工厂
pub struct HttpWorkerFactory {
    client: Client,
    limiter: Arc<BandwidthLimiter>,
    settings: TransferSettings,
}

impl HttpWorkerFactory {
    pub fn new(config: &DownloadConfig, limiter: Arc<BandwidthLimiter>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("peer-share-rust/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .context("创建HTTP客户端失败")?;

        Ok(Self {
            client,
            limiter,
            settings: TransferSettings {
                queued_retry: Duration::from_secs(config.queued_retry_secs),
                read_timeout: Duration::from_secs(config.read_timeout_secs.max(1)),
            },
        })
    }
}

impl WorkerFactory for HttpWorkerFactory {
    fn create(&self, info: Arc<DownloadInfo>, sink: Weak<dyn ChunkEventSink>) -> Arc<dyn DownloadWorker> {
        Arc::new_cyclic(|me| HttpDownloadWorker {
            core: WorkerCore::new(info, sink),
            client: self.client.clone(),
            limiter: self.limiter.clone(),
            settings: self.settings.clone(),
            prepared: OnceCell::new(),
            me: me.clone(),
        })
    }
}

/// 创建并预分配文件；已有的部分数据保留以便续传
async fn prepare_file(path: &Path, size: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("创建父目录失败")?;
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await
        .context("创建文件失败")?;
    let current = file.metadata().await.context("读取文件信息失败")?.len();
    if current != size {
        file.set_len(size).await.context("预分配文件空间失败")?;
    }

    debug!("文件准备完成: {:?}, 大小: {} bytes", path, size);
    Ok(())
}

async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("已删除未完成文件: {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除未完成文件失败: {:?}: {}", path, e),
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
