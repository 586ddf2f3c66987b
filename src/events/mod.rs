//! 事件模块
//!
//! - `types.rs`: 下载事件类型（状态变更、进度、移除）
//! - `bus.rs`: 事件总线，把事件分发给所有订阅者

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
