//! 分层进度/速度估算器
//!
//! 样本按固定时间桶（默认 100ms）聚合，保留一个滚动窗口（默认 10s）计算平均速度。
//! 跟踪器组成一棵树：分片 -> 文件 -> 整个下载队列，`progress()` 会逐级向上传递。

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 默认时间桶大小
pub const DEFAULT_BUCKET: Duration = Duration::from_millis(100);
/// 默认速度窗口
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
struct Sample {
    /// 桶起始时间
    at: Instant,
    amount: u64,
}

#[derive(Debug)]
struct TrackerState {
    maximum: u64,
    completed: u64,
    samples: VecDeque<Sample>,
}

/// 进度跟踪器
///
/// 每个跟踪器内部自带互斥，可被多个分片线程同时调用
#[derive(Debug)]
pub struct ProgressTracker {
    parent: Option<Arc<ProgressTracker>>,
    bucket: Duration,
    window: Duration,
    state: Mutex<TrackerState>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    /// 创建根跟踪器
    pub fn new() -> Self {
        Self::with_timing(None, DEFAULT_BUCKET, DEFAULT_WINDOW)
    }

    /// 创建子跟踪器，进度会汇总到 `parent`
    pub fn with_parent(parent: Arc<ProgressTracker>) -> Self {
        let (bucket, window) = (parent.bucket, parent.window);
        Self::with_timing(Some(parent), bucket, window)
    }

    pub fn with_timing(parent: Option<Arc<ProgressTracker>>, bucket: Duration, window: Duration) -> Self {
        Self {
            parent,
            bucket: bucket.max(Duration::from_millis(1)),
            window: window.max(bucket),
            state: Mutex::new(TrackerState {
                maximum: 0,
                completed: 0,
                samples: VecDeque::new(),
            }),
        }
    }

    /// 记录完成 `amount` 个单位
    pub fn progress(&self, amount: u64) {
        self.record(amount, Instant::now());
    }

    fn record(&self, amount: u64, now: Instant) {
        if amount == 0 {
            return;
        }
        {
            let mut state = self.state.lock();
            state.completed = state.completed.saturating_add(amount);

            match state.samples.back_mut() {
                Some(last) if now.saturating_duration_since(last.at) < self.bucket => {
                    last.amount += amount;
                }
                _ => state.samples.push_back(Sample { at: now, amount }),
            }
            Self::prune(&mut state.samples, now, self.window);
        }

        if let Some(parent) = &self.parent {
            parent.record(amount, now);
        }
    }

    /// 直接计入完成量但不产生速度样本（例如文件已在本地存在时一次性结清）
    pub fn fold(&self, amount: u64) {
        if amount == 0 {
            return;
        }
        {
            let mut state = self.state.lock();
            state.completed = state.completed.saturating_add(amount);
        }
        if let Some(parent) = &self.parent {
            parent.fold(amount);
        }
    }

    /// 设置总量（不计入进度）
    pub fn set_expected_maximum(&self, maximum: u64) {
        self.state.lock().maximum = maximum;
    }

    /// 追加总量（不计入进度）
    pub fn expand_task(&self, delta: u64) {
        let mut state = self.state.lock();
        state.maximum = state.maximum.saturating_add(delta);
    }

    pub fn maximum(&self) -> u64 {
        self.state.lock().maximum
    }

    pub fn completed(&self) -> u64 {
        self.state.lock().completed
    }

    /// 剩余量
    pub fn remaining(&self) -> u64 {
        let state = self.state.lock();
        state.maximum.saturating_sub(state.completed)
    }

    /// 完成百分比 (0-100)
    pub fn percent(&self) -> f64 {
        let state = self.state.lock();
        if state.maximum == 0 {
            return 0.0;
        }
        (state.completed as f64 / state.maximum as f64 * 100.0).min(100.0)
    }

    /// 窗口内平均速度（单位/秒）
    pub fn speed(&self) -> f64 {
        self.speed_at(Instant::now())
    }

    fn speed_at(&self, now: Instant) -> f64 {
        let mut state = self.state.lock();
        Self::prune(&mut state.samples, now, self.window);

        let Some(first) = state.samples.front() else {
            return 0.0;
        };
        let total: u64 = state.samples.iter().map(|s| s.amount).sum();
        let span = now
            .saturating_duration_since(first.at)
            .clamp(self.bucket, self.window);
        total as f64 / span.as_secs_f64()
    }

    /// 按当前速度线性外推的剩余时间；速度为 0 时返回 None（无穷大）
    pub fn estimated_time_remaining(&self) -> Option<Duration> {
        let speed = self.speed();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(self.remaining() as f64 / speed))
    }

    fn prune(samples: &mut VecDeque<Sample>, now: Instant, window: Duration) {
        while let Some(front) = samples.front() {
            if now.saturating_duration_since(front.at) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}
