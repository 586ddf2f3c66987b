use crate::downloader::{Chunk, FailCause};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// 下载任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    /// 已创建，等待开始（或等待任务位）
    Init,
    /// 下载中
    Started,
    /// 已暂停
    Paused,
    /// 所有分片已完成，正在校验
    Finalizing,
    /// 已完成
    Finished,
    /// 失败
    Failed,
    /// 链接跳转到了网页，需要外部提供新链接
    Redirect,
}

impl DownloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::Init => "init",
            DownloadState::Started => "started",
            DownloadState::Paused => "paused",
            DownloadState::Finalizing => "finalizing",
            DownloadState::Finished => "finished",
            DownloadState::Failed => "failed",
            DownloadState::Redirect => "redirect",
        }
    }

    /// 状态机允许的迁移
    pub fn can_transition_to(&self, next: DownloadState) -> bool {
        use DownloadState::*;
        matches!(
            (self, next),
            (Init, Started)
                | (Started, Paused)
                | (Started, Finalizing)
                | (Started, Failed)
                | (Started, Redirect)
                | (Paused, Started)
                | (Finalizing, Finished)
                | (Finalizing, Failed)
                | (Failed, Started)
                | (Redirect, Started)
        )
    }

    /// 是否为终止状态（failed / redirect 可以被重新启动）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Finished | DownloadState::Failed | DownloadState::Redirect
        )
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 目标文件已存在时的处理方式
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RedownloadMode {
    /// 不重新下载，任务失败
    Never,
    /// 重新下载到新文件名（file.1.ext）
    #[default]
    Always,
    /// 覆盖已有文件
    Replace,
}

/// 期望的文件摘要
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "algorithm", content = "value", rename_all = "lowercase")]
pub enum ExpectedDigest {
    Md5(String),
    Sha256(String),
}

/// 创建任务时的选项
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// Referer 头
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    /// 友好名称，仅在无法从响应或链接得到文件名时使用
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_hint: Option<String>,
    /// 调用方指定的文件名（优先级最高）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// 目标文件已存在时的处理方式
    #[serde(default)]
    pub redownload: RedownloadMode,
    /// 期望的文件摘要
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_digest: Option<ExpectedDigest>,
    /// 创建后不自动开始
    #[serde(default)]
    pub start_paused: bool,
}

/// 下载任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    /// 任务ID
    pub id: String,
    /// 任务状态
    pub state: DownloadState,
    /// 可用链接（按优先级排序，只追加不重排）
    pub urls: Vec<String>,
    /// 下载目录
    pub download_dir: PathBuf,
    /// 文件名（写入第一个分片前确定）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    /// 文件大小（收到第一个响应头之前未知）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// 已落盘的字节数
    pub received: u64,
    /// 校验阶段已处理的字节数
    pub verified: u64,
    /// 未完成的分片（仅暂停或部分完成时存在）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<Chunk>>,
    /// 服务器是否支持断点续传
    pub pausable: bool,
    /// 失败原因
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_cause: Option<FailCause>,
    /// 文件 MD5
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_md5: Option<String>,
    /// 创建选项
    #[serde(default)]
    pub options: DownloadOptions,
    /// 创建时间 (Unix timestamp, ms)
    pub created_at: i64,
    /// 首次开始时间 (ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    /// 完成时间 (ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_time: Option<i64>,
}

impl DownloadTask {
    pub fn new(urls: Vec<String>, download_dir: PathBuf, options: DownloadOptions) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: DownloadState::Init,
            urls,
            download_dir,
            local_path: None,
            size: None,
            received: 0,
            verified: 0,
            chunks: None,
            pausable: false,
            fail_cause: None,
            file_md5: None,
            options,
            created_at: chrono::Utc::now().timestamp_millis(),
            start_time: None,
            file_time: None,
        }
    }

    /// 完整的输出路径
    pub fn output_path(&self) -> Option<PathBuf> {
        self.local_path
            .as_ref()
            .map(|name| self.download_dir.join(name))
    }

    /// 计算进度百分比
    pub fn progress(&self) -> f64 {
        match self.size {
            Some(size) if size > 0 => (self.received as f64 / size as f64) * 100.0,
            _ => 0.0,
        }
    }

    /// 估算剩余时间 (秒)
    pub fn eta(&self, speed: u64) -> Option<u64> {
        let size = self.size?;
        if speed == 0 || self.received >= size {
            return None;
        }
        Some((size - self.received) / speed)
    }

    /// 切换状态，返回旧状态
    ///
    /// 只做记录层面的簿记（时间戳、失败原因），合法性由调用方保证
    pub(crate) fn set_state(&mut self, next: DownloadState) -> DownloadState {
        let old = self.state;
        self.state = next;
        match next {
            DownloadState::Started => {
                self.fail_cause = None;
                if self.start_time.is_none() {
                    self.start_time = Some(chrono::Utc::now().timestamp_millis());
                }
            }
            DownloadState::Finished => {
                self.file_time = Some(chrono::Utc::now().timestamp_millis());
                self.chunks = None;
            }
            _ => {}
        }
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> DownloadTask {
        DownloadTask::new(
            vec!["https://mirror.example.com/file.zip".to_string()],
            PathBuf::from("./downloads"),
            DownloadOptions::default(),
        )
    }

    #[test]
    fn test_task_creation() {
        let task = sample_task();
        assert_eq!(task.state, DownloadState::Init);
        assert_eq!(task.received, 0);
        assert!(task.size.is_none());
        assert!(task.output_path().is_none());
        assert!(!task.pausable);
    }

    #[test]
    fn test_progress_calculation() {
        let mut task = sample_task();
        assert_eq!(task.progress(), 0.0);

        task.size = Some(1000);
        task.received = 250;
        assert_eq!(task.progress(), 25.0);

        task.received = 1000;
        assert_eq!(task.progress(), 100.0);
    }

    #[test]
    fn test_eta_calculation() {
        let mut task = sample_task();
        task.size = Some(1000);
        task.received = 200;
        assert_eq!(task.eta(100), Some(8));
        assert_eq!(task.eta(0), None);
    }

    #[test]
    fn test_state_machine() {
        use DownloadState::*;
        assert!(Init.can_transition_to(Started));
        assert!(Started.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Started));
        assert!(Started.can_transition_to(Finalizing));
        assert!(Finalizing.can_transition_to(Finished));
        assert!(Finalizing.can_transition_to(Failed));
        assert!(Redirect.can_transition_to(Started));

        assert!(!Init.can_transition_to(Finished));
        assert!(!Paused.can_transition_to(Finalizing));
        assert!(!Finished.can_transition_to(Started));
    }

    #[test]
    fn test_set_state_bookkeeping() {
        let mut task = sample_task();
        task.fail_cause = Some(FailCause::from(&crate::downloader::DownloadError::Stalled(30)));

        let old = task.set_state(DownloadState::Started);
        assert_eq!(old, DownloadState::Init);
        assert!(task.fail_cause.is_none());
        assert!(task.start_time.is_some());

        task.chunks = Some(Vec::new());
        task.set_state(DownloadState::Finalizing);
        task.set_state(DownloadState::Finished);
        assert!(task.file_time.is_some());
        assert!(task.chunks.is_none());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&DownloadState::Finalizing).unwrap();
        assert_eq!(json, "\"finalizing\"");
        assert_eq!(DownloadState::Redirect.to_string(), "redirect");
    }
}
