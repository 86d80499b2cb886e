//! 全局下载限速（令牌桶）
//!
//! 所有分片传输共享一个桶，`0` 表示不限速，可在运行时调整

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::debug;

/// 允许的突发量（秒）
const BURST_SECONDS: f64 = 2.0;

#[derive(Debug)]
pub struct BandwidthLimiter {
    bucket: Mutex<TokenBucket>,
}

impl BandwidthLimiter {
    pub fn new(limit_kbps: u64) -> Self {
        let mut bucket = TokenBucket::unlimited();
        bucket.set_limit(limit_kbps);
        Self {
            bucket: Mutex::new(bucket),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn set_limit_kbps(&self, limit_kbps: u64) {
        self.bucket.lock().set_limit(limit_kbps);
        debug!("下载限速已设置: {} KB/s", limit_kbps);
    }

    pub fn limit_kbps(&self) -> u64 {
        self.bucket.lock().limit_kbps
    }

    pub fn is_limited(&self) -> bool {
        self.bucket.lock().limit_bytes_per_sec.is_some()
    }

    /// 申请 `bytes` 字节的额度，额度不足时等待
    pub async fn acquire(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let wait = self.bucket.lock().consume(bytes);
        if let Some(delay) = wait {
            sleep(delay).await;
        }
    }
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[derive(Debug)]
struct TokenBucket {
    limit_bytes_per_sec: Option<f64>,
    tokens: f64,
    capacity: f64,
    last_refill: Instant,
    limit_kbps: u64,
}

impl TokenBucket {
    fn unlimited() -> Self {
        Self {
            limit_bytes_per_sec: None,
            tokens: f64::INFINITY,
            capacity: f64::INFINITY,
            last_refill: Instant::now(),
            limit_kbps: 0,
        }
    }

    fn set_limit(&mut self, limit_kbps: u64) {
        self.limit_kbps = limit_kbps;
        self.last_refill = Instant::now();

        if limit_kbps == 0 {
            self.limit_bytes_per_sec = None;
            self.tokens = f64::INFINITY;
            self.capacity = f64::INFINITY;
            return;
        }

        let limit = limit_kbps as f64 * 1024.0;
        self.limit_bytes_per_sec = Some(limit);
        self.capacity = limit * BURST_SECONDS;
        self.tokens = self.tokens.min(self.capacity);
    }

    /// 扣除额度；不足时记为欠账并返回还清欠账需要等待的时间
    fn consume(&mut self, bytes: usize) -> Option<Duration> {
        let limit = self.limit_bytes_per_sec?;
        self.refill(limit);

        self.tokens -= bytes as f64;
        if self.tokens >= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(-self.tokens / limit))
    }

    fn refill(&mut self, limit: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * limit).min(self.capacity);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_waits() {
        let mut bucket = TokenBucket::unlimited();
        assert!(bucket.consume(100 * 1024 * 1024).is_none());
    }

    #[test]
    fn test_set_limit() {
        let limiter = BandwidthLimiter::new(100);
        assert!(limiter.is_limited());
        assert_eq!(limiter.limit_kbps(), 100);

        limiter.set_limit_kbps(0);
        assert!(!limiter.is_limited());
    }

    #[test]
    fn test_consume_over_limit() {
        let mut bucket = TokenBucket::unlimited();
        bucket.set_limit(1);
        bucket.tokens = 0.0;

        let wait = bucket.consume(1024).unwrap();
        assert!(wait.as_secs_f64() > 0.9 && wait.as_secs_f64() < 1.1);
    }

    #[test]
    fn test_concurrent_debt_accumulates() {
        let mut bucket = TokenBucket::unlimited();
        bucket.set_limit(1);
        bucket.tokens = 0.0;

        let first = bucket.consume(1024).unwrap();
        let second = bucket.consume(1024).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_consume_within_burst() {
        let mut bucket = TokenBucket::unlimited();
        bucket.set_limit(100);
        // 从不限速切换过来，桶是满的
        assert!(bucket.consume(150 * 1024).is_none());
    }

    #[tokio::test]
    async fn test_acquire_unlimited_returns_immediately() {
        let limiter = BandwidthLimiter::unlimited();
        tokio::time::timeout(Duration::from_millis(100), limiter.acquire(10 * 1024 * 1024))
            .await
            .unwrap();
    }
}
