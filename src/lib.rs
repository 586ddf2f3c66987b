// Mirror Downloader Library
// 多镜像分片下载引擎

// 配置管理模块
pub mod config;

// 下载引擎模块
pub mod downloader;

// 下载事件
pub mod events;

// 日志系统
pub mod logging;

// 导出常用类型
pub use config::{AppConfig, DownloadConfig, LogConfig};
pub use downloader::{
    ControlError, DownloadError, DownloadManager, DownloadOptions, DownloadState, DownloadTask,
    ExpectedDigest, RedirectDecision, RedirectResolver, RedownloadMode,
};
pub use events::DownloadEvent;
