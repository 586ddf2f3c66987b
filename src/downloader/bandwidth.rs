//! 全局带宽限制
//!
//! 所有任务的所有 worker 共享一个令牌桶，读取数据前先取令牌。
//! 限速值可以在运行时修改，0 表示不限速。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// 令牌不足时的等待间隔
const REFILL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct Bucket {
    tokens: u64,
    last_refill: Instant,
}

/// 令牌桶限速器
#[derive(Debug)]
pub struct BandwidthLimiter {
    /// bytes/s，0 = 不限速
    limit: AtomicU64,
    bucket: Mutex<Bucket>,
}

impl BandwidthLimiter {
    pub fn new(limit: u64) -> Self {
        Self {
            limit: AtomicU64::new(limit),
            // 初始为满桶（1 秒突发）
            bucket: Mutex::new(Bucket {
                tokens: limit,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::SeqCst)
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit() == 0
    }

    /// 修改限速，桶内令牌截断到新的上限
    pub fn set_limit(&self, limit: u64) {
        let old = self.limit.swap(limit, Ordering::SeqCst);
        if old != limit {
            let mut bucket = self.bucket.lock();
            bucket.tokens = bucket.tokens.min(limit);
            bucket.last_refill = Instant::now();
            tracing::info!("全局限速已调整: {} -> {} bytes/s", old, limit);
        }
    }

    /// 尝试立即取走最多 `amount` 个令牌，返回实际取得的数量
    fn try_take(&self, amount: u64, limit: u64) -> u64 {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let refill = (limit as f64 * elapsed.as_secs_f64()) as u64;
        if refill > 0 {
            // 最多积累 1 秒的令牌，避免暂停后突发
            bucket.tokens = bucket.tokens.saturating_add(refill).min(limit);
            bucket.last_refill = now;
        }

        let take = amount.min(bucket.tokens);
        bucket.tokens -= take;
        take
    }

    /// 获取 `amount` 字节的令牌
    ///
    /// 令牌不足时分批获取并等待，因此单次读取超过 1 秒配额也不会死锁。
    /// 被取消时返回 false。
    pub async fn acquire(&self, amount: u64, cancel: &CancellationToken) -> bool {
        let mut remaining = amount;
        while remaining > 0 {
            if cancel.is_cancelled() {
                return false;
            }

            let limit = self.limit();
            if limit == 0 {
                return true;
            }

            remaining -= self.try_take(remaining, limit);
            if remaining == 0 {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(REFILL_INTERVAL) => {}
            }
        }
        true
    }
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::new(0)
    }
}
