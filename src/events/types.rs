//! 下载事件类型定义

use crate::downloader::DownloadState;
use serde::{Deserialize, Serialize};

/// 下载任务事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// 任务创建
    Created {
        download_id: String,
        urls: Vec<String>,
    },
    /// 状态变更（同一任务的事件按发生顺序送达）
    StateChanged {
        download_id: String,
        old_state: DownloadState,
        new_state: DownloadState,
        /// Unix timestamp (ms)
        timestamp: i64,
    },
    /// 进度更新（每个采样周期一次）
    Progress {
        download_id: String,
        received: u64,
        size: Option<u64>,
        /// 校验阶段已处理的字节数
        verified: u64,
        /// bytes/s
        speed: u64,
    },
    /// 任务被移除（取消或确认完成）
    Removed { download_id: String },
}

impl DownloadEvent {
    /// 获取任务 ID
    pub fn download_id(&self) -> &str {
        match self {
            DownloadEvent::Created { download_id, .. } => download_id,
            DownloadEvent::StateChanged { download_id, .. } => download_id,
            DownloadEvent::Progress { download_id, .. } => download_id,
            DownloadEvent::Removed { download_id } => download_id,
        }
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            DownloadEvent::Created { .. } => "created",
            DownloadEvent::StateChanged { .. } => "state_changed",
            DownloadEvent::Progress { .. } => "progress",
            DownloadEvent::Removed { .. } => "removed",
        }
    }

    pub(crate) fn state_changed(
        download_id: &str,
        old_state: DownloadState,
        new_state: DownloadState,
    ) -> Self {
        DownloadEvent::StateChanged {
            download_id: download_id.to_string(),
            old_state,
            new_state,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = DownloadEvent::state_changed("abc", DownloadState::Init, DownloadState::Started);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "state_changed");
        assert_eq!(json["download_id"], "abc");
        assert_eq!(json["old_state"], "init");
        assert_eq!(json["new_state"], "started");
        assert_eq!(event.event_type_name(), "state_changed");
    }

    #[test]
    fn test_progress_round_trip() {
        let event = DownloadEvent::Progress {
            download_id: "abc".to_string(),
            received: 10,
            size: None,
            verified: 0,
            speed: 5,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: DownloadEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.download_id(), "abc");
    }
}
