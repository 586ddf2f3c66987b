//! 事件总线
//!
//! 每个订阅者一个无界通道，发布方从不阻塞；订阅者丢弃接收端后自动移除。

use crate::events::DownloadEvent;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DownloadEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅所有后续事件
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DownloadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: DownloadEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if subscribers.is_empty() {
            debug!("无订阅者，丢弃事件: {}", event.event_type_name());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(DownloadEvent::Removed {
            download_id: "x".to_string(),
        });

        assert_eq!(a.recv().await.unwrap().download_id(), "x");
        assert_eq!(b.recv().await.unwrap().download_id(), "x");
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let _b = bus.subscribe();
        drop(a);

        bus.publish(DownloadEvent::Removed {
            download_id: "x".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 1);
    }
}
