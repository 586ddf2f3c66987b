use crate::config::DownloadConfig;
use crate::downloader::chunk::plan_chunk_len;
use crate::downloader::{Chunk, DownloadError};
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 退避基础时长
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// 退避上限
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// 全局限制
///
/// 所有任务共享，运行时可调整（原子变量，无需加锁）
#[derive(Debug)]
pub struct EngineLimits {
    min_chunk_size: AtomicU64,
    max_chunks: AtomicUsize,
    max_retries: AtomicU32,
    stall_timeout_secs: AtomicU64,
    download_timeout_secs: AtomicU64,
}

impl EngineLimits {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            min_chunk_size: AtomicU64::new(config.min_chunk_size),
            max_chunks: AtomicUsize::new(config.max_chunks),
            max_retries: AtomicU32::new(config.max_retries),
            stall_timeout_secs: AtomicU64::new(config.stall_timeout_secs),
            download_timeout_secs: AtomicU64::new(config.download_timeout_secs),
        }
    }

    /// 应用新配置（对正在进行的任务同样生效）
    pub fn apply(&self, config: &DownloadConfig) {
        self.min_chunk_size
            .store(config.min_chunk_size, Ordering::SeqCst);
        self.set_max_chunks(config.max_chunks);
        self.max_retries.store(config.max_retries, Ordering::SeqCst);
        self.stall_timeout_secs
            .store(config.stall_timeout_secs, Ordering::SeqCst);
        self.download_timeout_secs
            .store(config.download_timeout_secs, Ordering::SeqCst);
    }

    pub fn set_max_chunks(&self, max_chunks: usize) {
        let old = self.max_chunks.swap(max_chunks.max(1), Ordering::SeqCst);
        if old != max_chunks {
            info!("调整单任务最大分片并发: {} -> {}", old, max_chunks);
        }
    }

    pub fn min_chunk_size(&self) -> u64 {
        self.min_chunk_size.load(Ordering::SeqCst)
    }

    pub fn max_chunks(&self) -> usize {
        self.max_chunks.load(Ordering::SeqCst).max(1)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.load(Ordering::SeqCst)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs.load(Ordering::SeqCst).max(1))
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs.load(Ordering::SeqCst).max(1))
    }
}

/// 分片失败后的处理决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// 等待 `delay` 后把剩余范围交给下一个链接
    Retry { delay: Duration },
    /// 重试次数用尽
    Exhausted,
    /// 所有链接都永久失败
    NoUsableUrl,
    /// 不可重试的错误，任务直接失败
    Fatal,
}

/// 单任务的分片调度策略
///
/// 负责：
/// 1. 计算分片大小
/// 2. 决定可以同时运行的租约数量
/// 3. 链接选择（首次取优先级最高的可用链接，重试时轮换）
/// 4. 记录永久失败的链接、重试计数和退避
#[derive(Debug)]
pub struct ChunkScheduler {
    limits: Arc<EngineLimits>,
    url_count: usize,
    /// 本任务内永久失败的链接索引
    failed_urls: HashSet<usize>,
    /// 服务器是否支持 Range
    range_supported: bool,
}

impl ChunkScheduler {
    pub fn new(limits: Arc<EngineLimits>, url_count: usize) -> Self {
        Self {
            limits,
            url_count,
            failed_urls: HashSet::new(),
            range_supported: true,
        }
    }

    /// 链接列表追加后更新数量
    pub fn set_url_count(&mut self, url_count: usize) {
        self.url_count = url_count;
    }

    pub fn set_range_supported(&mut self, supported: bool) {
        self.range_supported = supported;
    }

    pub fn range_supported(&self) -> bool {
        self.range_supported
    }

    /// 分片大小: max(min_chunk_size, ceil(size / max_chunks))
    pub fn chunk_len(&self, size: u64) -> u64 {
        plan_chunk_len(size, self.limits.min_chunk_size(), self.limits.max_chunks())
    }

    /// 允许同时运行的租约数量（不支持 Range 时只能有一个）
    pub fn max_leases(&self) -> usize {
        if self.range_supported {
            self.limits.max_chunks()
        } else {
            1
        }
    }

    pub fn is_usable(&self, url_index: usize) -> bool {
        url_index < self.url_count && !self.failed_urls.contains(&url_index)
    }

    pub fn has_usable_url(&self) -> bool {
        (0..self.url_count).any(|i| self.is_usable(i))
    }

    /// 优先级最高的可用链接
    pub fn first_url(&self) -> Option<usize> {
        (0..self.url_count).find(|i| self.is_usable(*i))
    }

    /// `last` 之后的下一个可用链接（循环，最后才回到 `last` 自身）
    pub fn next_url_after(&self, last: usize) -> Option<usize> {
        if self.url_count == 0 {
            return None;
        }
        (1..=self.url_count)
            .map(|step| (last + step) % self.url_count)
            .find(|i| self.is_usable(*i))
    }

    /// 为分片选择链接
    pub fn select_url(&self, chunk: &Chunk) -> Option<usize> {
        if chunk.retries == 0 {
            self.first_url()
        } else {
            self.next_url_after(chunk.url_index)
        }
    }

    /// 标记链接永久失败
    pub fn mark_failed(&mut self, url_index: usize) {
        if self.failed_urls.insert(url_index) {
            warn!("链接 #{} 永久失败，本任务内不再使用", url_index);
        }
    }

    /// 任务重新开始时清空失败记录
    pub fn reset(&mut self) {
        self.failed_urls.clear();
        self.range_supported = true;
    }

    /// 分片失败后决定如何处理，必要时更新重试计数
    pub fn on_failure(&mut self, chunk: &mut Chunk, error: &DownloadError) -> RetryDecision {
        if error.is_permanent_for_url() {
            self.mark_failed(chunk.url_index);
            if !self.has_usable_url() {
                return RetryDecision::NoUsableUrl;
            }
            // 换链接不计入重试次数，但之后按轮换选择
            chunk.retries = chunk.retries.max(1);
            return RetryDecision::Retry {
                delay: Duration::ZERO,
            };
        }

        if !error.is_retryable() {
            return RetryDecision::Fatal;
        }

        chunk.retries += 1;
        let max_retries = self.limits.max_retries();
        if chunk.retries > max_retries {
            warn!(
                "分片 offset={} 重试次数用尽 ({}/{}), 最后错误: {}",
                chunk.offset, chunk.retries, max_retries, error
            );
            return RetryDecision::Exhausted;
        }

        let delay = if error.needs_backoff() {
            backoff_delay(chunk.retries)
        } else {
            Duration::ZERO
        };
        debug!(
            "分片 offset={} 将在 {:?} 后重试 (第 {} 次), 错误: {}",
            chunk.offset, delay, chunk.retries, error
        );
        RetryDecision::Retry { delay }
    }
}

/// 指数退避 + 随机抖动
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = BACKOFF_BASE.saturating_mul(1u32 << exp).min(BACKOFF_MAX);
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
    base + Duration::from_millis(jitter_ms)
}
