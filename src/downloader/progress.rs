//! 速度统计
//!
//! 按固定间隔对一个单调计数器（已落盘字节数）取差值，
//! 换算成 bytes/s 后写入定长环形缓冲区，最旧的样本被淘汰。

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 默认采样间隔
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
/// 默认保留的样本数
pub const DEFAULT_HISTORY_LEN: usize = 30;

/// 速度跟踪器
#[derive(Debug, Clone)]
pub struct SpeedTracker {
    capacity: usize,
    history: VecDeque<u64>,
    last_counter: u64,
    last_sample: Instant,
}

impl SpeedTracker {
    pub fn new(capacity: usize) -> Self {
        Self::with_start(capacity, 0, Instant::now())
    }

    /// 从已有计数开始统计（恢复下载时避免把历史字节算成瞬时速度）
    pub fn with_start(capacity: usize, counter: u64, now: Instant) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            history: VecDeque::with_capacity(capacity),
            last_counter: counter,
            last_sample: now,
        }
    }

    /// 以当前时间采样
    pub fn sample(&mut self, counter: u64) -> u64 {
        self.sample_at(counter, Instant::now())
    }

    /// 采样：记录自上次采样以来的增量，返回本次速度
    pub fn sample_at(&mut self, counter: u64, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.last_sample);
        let delta = counter.saturating_sub(self.last_counter);

        let speed = if elapsed.is_zero() {
            delta
        } else {
            (delta as f64 / elapsed.as_secs_f64()).round() as u64
        };

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(speed);

        self.last_counter = counter;
        self.last_sample = now;
        speed
    }

    /// 计数器被重置（例如校验失败后重新下载）
    pub fn rebase(&mut self, counter: u64) {
        self.last_counter = counter;
        self.last_sample = Instant::now();
    }

    /// 最近一次的速度
    pub fn speed(&self) -> u64 {
        self.history.back().copied().unwrap_or(0)
    }

    /// 历史速度，最旧的在前
    pub fn history(&self) -> Vec<u64> {
        self.history.iter().copied().collect()
    }

    /// 调整缓冲区容量，超出部分丢弃最旧的样本
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_per_second() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::with_start(3, 0, start);

        assert_eq!(tracker.sample_at(1000, start + Duration::from_secs(1)), 1000);
        // 两秒内 4000 字节
        assert_eq!(tracker.sample_at(5000, start + Duration::from_secs(3)), 2000);
        assert_eq!(tracker.speed(), 2000);
        assert_eq!(tracker.history(), vec![1000, 2000]);
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::with_start(3, 0, start);
        for i in 1..=5u64 {
            tracker.sample_at(i * 100, start + Duration::from_secs(i));
        }
        assert_eq!(tracker.history().len(), 3);
        assert_eq!(tracker.history(), vec![100, 100, 100]);
    }

    #[test]
    fn test_counter_reset_is_not_negative() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::with_start(5, 1000, start);
        assert_eq!(tracker.sample_at(0, start + Duration::from_secs(1)), 0);
    }

    #[test]
    fn test_set_capacity() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::with_start(10, 0, start);
        for i in 1..=6u64 {
            tracker.sample_at(i * 10 * i, start + Duration::from_secs(i));
        }
        tracker.set_capacity(2);
        assert_eq!(tracker.history().len(), 2);
        assert_eq!(tracker.speed(), 110);
    }

    #[test]
    fn test_empty_tracker() {
        let tracker = SpeedTracker::default();
        assert_eq!(tracker.speed(), 0);
        assert!(tracker.history().is_empty());
    }
}
