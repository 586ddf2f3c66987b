//! 任务位池管理模块
//!
//! 实现同时下载任务数上限（max_parallel_downloads）。
//! 任务在进入 started 前必须拿到一个任务位；等待的任务按先来后到排队。

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 任务位
#[derive(Debug, Clone)]
pub struct TaskSlot {
    /// 槽位ID
    pub id: usize,
    /// 占用此位的任务ID
    pub task_id: Option<String>,
}

impl TaskSlot {
    fn new(id: usize) -> Self {
        Self { id, task_id: None }
    }

    pub fn is_free(&self) -> bool {
        self.task_id.is_none()
    }
}

/// 任务位池管理器
#[derive(Debug)]
pub struct TaskSlotPool {
    /// 最大槽位数（支持动态调整）
    max_slots: AtomicUsize,
    /// 槽位列表
    slots: RwLock<Vec<TaskSlot>>,
    /// 等待队列（任务ID，先来先得）
    waiting: Mutex<VecDeque<String>>,
    /// 有槽位释放或扩容时唤醒等待者
    notify: Notify,
}

impl TaskSlotPool {
    pub fn new(max_slots: usize) -> Self {
        let max_slots = max_slots.max(1);
        info!("创建任务位池，最大槽位数: {}", max_slots);

        Self {
            max_slots: AtomicUsize::new(max_slots),
            slots: RwLock::new((0..max_slots).map(TaskSlot::new).collect()),
            waiting: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots.load(Ordering::SeqCst)
    }

    /// 动态调整槽位池容量
    ///
    /// 缩容不会中断已占用的槽位，超出新上限的任务继续运行到释放为止
    pub async fn resize(&self, new_max: usize) {
        let new_max = new_max.max(1);
        let old_max = self.max_slots.load(Ordering::SeqCst);
        if new_max == old_max {
            debug!("任务位池容量无需调整: {}", old_max);
            return;
        }

        let mut slots = self.slots.write().await;
        if new_max > old_max {
            let existing = slots.len();
            for i in existing..new_max {
                slots.push(TaskSlot::new(i));
            }
            info!("✅ 任务位池扩容: {} -> {}", old_max, new_max);
        } else {
            let occupied_beyond_limit = slots
                .iter()
                .filter(|s| s.id >= new_max && !s.is_free())
                .count();
            if occupied_beyond_limit > 0 {
                warn!(
                    "⚠️ 任务位池缩容: {} -> {} (有 {} 个超出新上限的槽位仍被占用，将继续运行)",
                    old_max, new_max, occupied_beyond_limit
                );
            }
            slots.retain(|s| s.id < new_max || !s.is_free());
            info!("✅ 任务位池缩容: {} -> {}", old_max, new_max);
        }
        self.max_slots.store(new_max, Ordering::SeqCst);
        drop(slots);

        self.notify.notify_waiters();
    }

    /// 不排队，立即尝试分配
    pub async fn try_allocate(&self, task_id: &str) -> Option<usize> {
        let max_slots = self.max_slots.load(Ordering::SeqCst);
        let mut slots = self.slots.write().await;
        if let Some(existing) = slots.iter().find(|s| s.task_id.as_deref() == Some(task_id)) {
            return Some(existing.id);
        }
        if !self.waiting.lock().is_empty() {
            return None;
        }
        Self::allocate_in(&mut slots, max_slots, task_id)
    }

    fn allocate_in(slots: &mut [TaskSlot], max_slots: usize, task_id: &str) -> Option<usize> {
        let occupied = slots.iter().filter(|s| !s.is_free()).count();
        if occupied >= max_slots {
            return None;
        }
        let slot = slots.iter_mut().find(|s| s.id < max_slots && s.is_free())?;
        slot.task_id = Some(task_id.to_string());
        info!("分配任务位: slot_id={}, task_id={}", slot.id, task_id);
        Some(slot.id)
    }

    /// 排在等待队列里的任务尝试分配：只有排在空闲位数量之内的才能拿到
    async fn allocate_queued(&self, task_id: &str) -> Option<usize> {
        let max_slots = self.max_slots.load(Ordering::SeqCst);
        let mut slots = self.slots.write().await;
        let mut waiting = self.waiting.lock();

        let position = waiting.iter().position(|id| id == task_id)?;
        let occupied = slots.iter().filter(|s| !s.is_free()).count();
        let free = max_slots.saturating_sub(occupied);
        if position >= free {
            return None;
        }

        let slot_id = Self::allocate_in(&mut slots, max_slots, task_id)?;
        waiting.remove(position);
        Some(slot_id)
    }

    /// 等待并获取任务位，被取消时返回 None
    pub async fn acquire(&self, task_id: &str, cancel: &CancellationToken) -> Option<usize> {
        if let Some(slot) = self.slot_of(task_id).await {
            return Some(slot);
        }

        {
            let mut waiting = self.waiting.lock();
            if !waiting.iter().any(|id| id == task_id) {
                waiting.push_back(task_id.to_string());
            }
        }

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(slot) = self.allocate_queued(task_id).await {
                // 可能还有空位留给排在后面的任务
                self.notify.notify_waiters();
                return Some(slot);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.waiting.lock().retain(|id| id != task_id);
                    self.notify.notify_waiters();
                    debug!("任务取消等待任务位: {}", task_id);
                    return None;
                }
                _ = &mut notified => {}
            }
        }
    }

    /// 释放任务占用的槽位
    pub async fn release(&self, task_id: &str) -> bool {
        let mut released = false;
        {
            let max_slots = self.max_slots.load(Ordering::SeqCst);
            let mut slots = self.slots.write().await;
            if let Some(slot) = slots
                .iter_mut()
                .find(|s| s.task_id.as_deref() == Some(task_id))
            {
                slot.task_id = None;
                released = true;
                info!("释放任务位: slot_id={}, task_id={}", slot.id, task_id);
            }
            // 缩容后残留的空闲槽位
            slots.retain(|s| s.id < max_slots || !s.is_free());
        }
        self.waiting.lock().retain(|id| id != task_id);

        if released {
            self.notify.notify_waiters();
        }
        released
    }

    pub async fn slot_of(&self, task_id: &str) -> Option<usize> {
        let slots = self.slots.read().await;
        slots
            .iter()
            .find(|s| s.task_id.as_deref() == Some(task_id))
            .map(|s| s.id)
    }

    pub async fn used_slots(&self) -> usize {
        let slots = self.slots.read().await;
        slots.iter().filter(|s| !s.is_free()).count()
    }

    pub async fn available_slots(&self) -> usize {
        self.max_slots().saturating_sub(self.used_slots().await)
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_allocate_and_release() {
        let pool = TaskSlotPool::new(2);
        assert_eq!(pool.try_allocate("a").await, Some(0));
        assert_eq!(pool.try_allocate("b").await, Some(1));
        assert_eq!(pool.try_allocate("c").await, None);

        // 同一任务重复分配返回已有槽位
        assert_eq!(pool.try_allocate("a").await, Some(0));

        assert!(pool.release("a").await);
        assert!(!pool.release("a").await);
        assert_eq!(pool.available_slots().await, 1);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let pool = Arc::new(TaskSlotPool::new(1));
        let cancel = CancellationToken::new();
        assert_eq!(pool.acquire("a", &cancel).await, Some(0));

        let waiter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire("b", &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(pool.waiting_count(), 1);

        pool.release("a").await;
        let slot = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(slot, Some(0));
        assert_eq!(pool.slot_of("b").await, Some(0));
    }

    #[tokio::test]
    async fn test_acquire_is_fifo() {
        let pool = Arc::new(TaskSlotPool::new(1));
        let cancel = CancellationToken::new();
        pool.acquire("holder", &cancel).await;

        let first = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire("first", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire("second", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.release("holder").await;
        assert_eq!(first.await.unwrap(), Some(0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        pool.release("first").await;
        assert_eq!(second.await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_acquire_cancelled() {
        let pool = Arc::new(TaskSlotPool::new(1));
        let cancel = CancellationToken::new();
        pool.acquire("a", &cancel).await;

        let waiter_cancel = CancellationToken::new();
        let waiter = {
            let pool = pool.clone();
            let token = waiter_cancel.clone();
            tokio::spawn(async move { pool.acquire("b", &token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter_cancel.cancel();

        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(pool.waiting_count(), 0);
    }

    #[tokio::test]
    async fn test_resize_wakes_waiters() {
        let pool = Arc::new(TaskSlotPool::new(1));
        let cancel = CancellationToken::new();
        pool.acquire("a", &cancel).await;

        let waiter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire("b", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.resize(2).await;
        let slot = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(slot, Some(1));
    }

    #[tokio::test]
    async fn test_shrink_keeps_running_tasks() {
        let pool = TaskSlotPool::new(2);
        pool.try_allocate("a").await;
        pool.try_allocate("b").await;

        pool.resize(1).await;
        assert_eq!(pool.max_slots(), 1);
        assert_eq!(pool.used_slots().await, 2);

        // 释放后仍然超过上限，不能分配
        pool.release("a").await;
        assert_eq!(pool.try_allocate("c").await, None);

        pool.release("b").await;
        assert_eq!(pool.try_allocate("c").await, Some(0));
    }
}
