//! 事件节流器
//!
//! 分片线程会并发地产生大量事件，这里提供两种工具：
//! - `EventThrottler`：基于原子时间戳的节流判断，决定本次是否上报
//! - `UpdateCoalescer`：线程安全的待发送集合，按固定间隔批量冲刷给订阅者

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 250;

/// 广播通道容量
const BROADCAST_CAPACITY: usize = 256;

/// 事件节流器
///
/// 典型用法：每次产生事件时调用 `should_emit()`，返回 true 时才真正发布
#[derive(Debug)]
pub struct EventThrottler {
    /// 节流器创建时刻，时间戳都相对它计算
    origin: Instant,
    /// 上次发布事件的时间戳（纳秒，相对 origin + 1，0 表示从未发布）
    last_emit_nanos: AtomicU64,
    interval_nanos: u64,
}

impl EventThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 检查是否应该发布事件
    ///
    /// 距离上次发布超过间隔时返回 true 并更新时间戳（CAS，并发调用只有一个成功）
    pub fn should_emit(&self) -> bool {
        let now = self.now_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != 0 && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    fn now_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64 + 1
    }
}

impl Default for EventThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}

#[derive(Debug)]
struct Pending<K> {
    order: Vec<K>,
    seen: HashSet<K>,
}

/// 待发送更新的合并器
///
/// `push` 可以在任意线程调用，同一个键在一个间隔内只会发送一次；
/// 冲刷时按首次加入的顺序整批广播。
#[derive(Debug)]
pub struct UpdateCoalescer<K> {
    pending: Mutex<Pending<K>>,
    sender: broadcast::Sender<Vec<K>>,
}

impl<K> UpdateCoalescer<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            pending: Mutex::new(Pending {
                order: Vec::new(),
                seen: HashSet::new(),
            }),
            sender,
        }
    }

    /// 加入一条待发送更新
    pub fn push(&self, key: K) {
        let mut pending = self.pending.lock();
        if pending.seen.insert(key.clone()) {
            pending.order.push(key);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<K>> {
        self.sender.subscribe()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().order.len()
    }

    /// 立即冲刷，返回发送的条数
    pub fn flush(&self) -> usize {
        let batch = {
            let mut pending = self.pending.lock();
            if pending.order.is_empty() {
                return 0;
            }
            pending.seen.clear();
            std::mem::take(&mut pending.order)
        };
        let count = batch.len();
        // 没有订阅者时发送失败，直接丢弃
        let _ = self.sender.send(batch);
        count
    }

    /// 启动后台冲刷任务，`token` 取消时做最后一次冲刷后退出
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let coalescer = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = token.cancelled() => {
                        if let Some(coalescer) = coalescer.upgrade() {
                            coalescer.flush();
                        }
                        break;
                    }
                }
                let Some(coalescer) = coalescer.upgrade() else {
                    break;
                };
                coalescer.flush();
            }
        })
    }
}

impl<K> Default for UpdateCoalescer<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
