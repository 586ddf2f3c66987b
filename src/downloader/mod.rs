pub mod bandwidth;
pub mod chunk;
mod coordinator;
pub mod engine;
pub mod error;
pub mod manager;
pub mod progress;
pub mod scheduler;
pub mod task;
pub mod task_slot_pool;
pub mod verifier;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use bandwidth::BandwidthLimiter;
pub use chunk::{Chunk, ChunkError, ChunkStore, Lease, LeaseId};
pub use engine::{DownloadEngine, RedirectDecision, RedirectResolver};
pub use error::{ControlError, DownloadError, FailCause, FailKind};
pub use manager::DownloadManager;
pub use progress::SpeedTracker;
pub use scheduler::{ChunkScheduler, EngineLimits, RetryDecision};
pub use task::{DownloadOptions, DownloadState, DownloadTask, ExpectedDigest, RedownloadMode};
pub use task_slot_pool::{TaskSlot, TaskSlotPool};
pub use verifier::VerifyOutcome;
