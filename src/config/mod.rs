// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 下载队列配置
    #[serde(default)]
    pub queue: QueueConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 默认下载目录
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 全局同时传输的分片数上限
    #[serde(default = "default_max_active_slots")]
    pub max_active_slots: usize,
    /// 单个文件同时传输的分片数上限
    #[serde(default = "default_max_slots_per_file")]
    pub max_slots_per_file: usize,
    /// 全局下载限速 (KB/s)，0 表示不限速
    #[serde(default)]
    pub speed_limit_kbps: u64,
    /// 调度循环最小间隔（毫秒）
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    /// 分片至少下载多久才允许拆分（秒）
    #[serde(default = "default_min_split_interval_secs")]
    pub min_split_interval_secs: u64,
    /// 完成度低于该百分比的分片才允许拆分
    #[serde(default = "default_split_threshold_percent")]
    pub split_threshold_percent: u8,
    /// 查询下载源的超时（秒）
    #[serde(default = "default_source_lookup_timeout_secs")]
    pub source_lookup_timeout_secs: u64,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 读取超时（秒）
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// 对端让我们排队且没有给出 Retry-After 时的等待时间（秒）
    #[serde(default = "default_queued_retry_secs")]
    pub queued_retry_secs: u64,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}
fn default_max_active_slots() -> usize {
    8
}
fn default_max_slots_per_file() -> usize {
    4
}
fn default_dispatch_interval_ms() -> u64 {
    1000
}
fn default_min_split_interval_secs() -> u64 {
    10
}
fn default_split_threshold_percent() -> u8 {
    50
}
fn default_source_lookup_timeout_secs() -> u64 {
    10
}
fn default_connect_timeout_secs() -> u64 {
    15
}
fn default_read_timeout_secs() -> u64 {
    60
}
fn default_queued_retry_secs() -> u64 {
    30
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_active_slots: default_max_active_slots(),
            max_slots_per_file: default_max_slots_per_file(),
            speed_limit_kbps: 0,
            dispatch_interval_ms: default_dispatch_interval_ms(),
            min_split_interval_secs: default_min_split_interval_secs(),
            split_threshold_percent: default_split_threshold_percent(),
            source_lookup_timeout_secs: default_source_lookup_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            queued_retry_secs: default_queued_retry_secs(),
        }
    }
}

impl DownloadConfig {
    /// 修正明显不合理的配置值
    pub fn validate(&mut self) {
        if self.max_active_slots == 0 {
            tracing::warn!("max_active_slots 不能为 0，已修正为 1");
            self.max_active_slots = 1;
        }
        if self.max_slots_per_file == 0 {
            tracing::warn!("max_slots_per_file 不能为 0，已修正为 1");
            self.max_slots_per_file = 1;
        }
        self.split_threshold_percent = self.split_threshold_percent.clamp(1, 100);
        if self.dispatch_interval_ms == 0 {
            self.dispatch_interval_ms = default_dispatch_interval_ms();
        }
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn min_split_interval(&self) -> Duration {
        Duration::from_secs(self.min_split_interval_secs)
    }

    pub fn source_lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.source_lookup_timeout_secs)
    }
}

/// 下载队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 应用私有数据目录
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// 队列文件名
    #[serde(default = "default_state_file_name")]
    pub state_file_name: String,
    /// 两次保存之间的最小间隔（毫秒），期间的改动合并为一次保存
    #[serde(default = "default_min_save_interval_ms")]
    pub min_save_interval_ms: u64,
    /// UI 事件最小刷新间隔（毫秒）
    #[serde(default = "default_ui_event_interval_ms")]
    pub ui_event_interval_ms: u64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_state_file_name() -> String {
    "download_queue.bin".to_string()
}
fn default_min_save_interval_ms() -> u64 {
    5000
}
fn default_ui_event_interval_ms() -> u64 {
    250
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            state_file_name: default_state_file_name(),
            min_save_interval_ms: default_min_save_interval_ms(),
            ui_event_interval_ms: default_ui_event_interval_ms(),
        }
    }
}

impl QueueConfig {
    /// 队列文件完整路径
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(&self.state_file_name)
    }

    pub fn min_save_interval(&self) -> Duration {
        Duration::from_millis(self.min_save_interval_ms)
    }

    pub fn ui_event_interval(&self) -> Duration {
        Duration::from_millis(self.ui_event_interval_ms.max(1))
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .await
            .context("Failed to read config file")?;

        let mut config: AppConfig =
            toml::from_str(&content).context("Failed to parse config file")?;
        config.download.validate();

        Ok(config)
    }

    /// 保存配置到文件（先写临时文件再重命名）
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        let temp_path = path.with_extension("toml.tmp");
        fs::write(&temp_path, content)
            .await
            .context("Failed to write config file")?;
        fs::rename(&temp_path, path)
            .await
            .context("Failed to replace config file")?;

        tracing::info!("✓ 配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {:#}", e);
                }
                default_config
            }
        }
    }
}
