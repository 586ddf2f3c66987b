//! 下载错误类型
//!
//! - `DownloadError`: 传输/校验过程中产生的错误，由调度器决定重试或终止
//! - `ControlError`: 公共控制接口（暂停、恢复、取消等）返回的错误
//! - `FailCause`: 任务失败时记录在任务上的原因，供外部展示

use crate::downloader::DownloadState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 传输错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DownloadError {
    /// 超过阈值时间没有收到任何数据
    #[error("连接停滞: {0} 秒内未收到数据")]
    Stalled(u64),
    /// 连接被拒绝/重置、DNS 失败、连接提前关闭等
    #[error("网络错误: {0}")]
    Network(String),
    /// 服务器返回了错误状态码
    #[error("HTTP错误: {0}")]
    HttpStatus(u16),
    /// 对 offset > 0 的 Range 请求返回了 200
    #[error("服务器忽略了 Range 请求")]
    RangeIgnored,
    /// 文件校验失败
    #[error("文件已损坏: {0}")]
    CorruptDownload(String),
    /// 链接指向了一个网页而不是文件
    #[error("链接跳转到了网页: {0}")]
    RedirectedAway(String),
    /// 磁盘写入/读取失败
    #[error("磁盘错误: {0}")]
    Disk(String),
    /// 目标文件已存在（redownload = never）
    #[error("文件已存在: {0}")]
    AlreadyExists(String),
    /// 被取消
    #[error("下载已取消")]
    Cancelled,
}

impl DownloadError {
    /// 是否对当前链接永久失败（4xx，429 除外）
    ///
    /// 永久失败的链接在本任务内不会再被选择，其他链接仍会尝试
    pub fn is_permanent_for_url(&self) -> bool {
        match self {
            DownloadError::HttpStatus(status) => (400..500).contains(status) && *status != 429,
            DownloadError::RangeIgnored => true,
            _ => false,
        }
    }

    /// 是否可以在同一分片上重试
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Stalled(_) | DownloadError::Network(_) => true,
            DownloadError::HttpStatus(status) => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// 是否需要退避等待后再重试（网络类错误）
    pub fn needs_backoff(&self) -> bool {
        matches!(
            self,
            DownloadError::Network(_) | DownloadError::HttpStatus(_)
        )
    }

    /// 错误分类
    pub fn kind(&self) -> FailKind {
        match self {
            DownloadError::Stalled(_) => FailKind::Stalled,
            DownloadError::Network(_) => FailKind::Network,
            DownloadError::HttpStatus(_) | DownloadError::RangeIgnored => FailKind::Http,
            DownloadError::CorruptDownload(_) => FailKind::CorruptDownload,
            DownloadError::RedirectedAway(_) => FailKind::RedirectedAway,
            DownloadError::Disk(_) => FailKind::Disk,
            DownloadError::AlreadyExists(_) => FailKind::AlreadyExists,
            DownloadError::Cancelled => FailKind::Cancelled,
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return DownloadError::HttpStatus(status.as_u16());
        }
        DownloadError::Network(err.to_string())
    }
}

/// 失败分类
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailKind {
    Stalled,
    Network,
    Http,
    CorruptDownload,
    RedirectedAway,
    Disk,
    AlreadyExists,
    Cancelled,
}

/// 任务失败原因
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailCause {
    /// 失败分类
    pub kind: FailKind,
    /// 详细描述
    pub message: String,
    /// 跳转到的网页地址（仅 redirect 时存在）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_url: Option<String>,
}

impl From<&DownloadError> for FailCause {
    fn from(err: &DownloadError) -> Self {
        let html_url = match err {
            DownloadError::RedirectedAway(url) => Some(url.clone()),
            _ => None,
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            html_url,
        }
    }
}

/// 控制接口错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("任务不存在: {0}")]
    NotFound(String),
    #[error("当前状态 {0} 不支持该操作")]
    InvalidState(DownloadState),
    #[error("服务器不支持断点续传，无法暂停")]
    NotPausable,
    #[error("至少需要一个下载链接")]
    EmptyUrls,
    #[error("无效的下载链接: {0}")]
    InvalidUrl(String),
    #[error("下载管理器已关闭")]
    Shutdown,
}
