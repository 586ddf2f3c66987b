//! 下载引擎
//!
//! 所有任务共享的运行时上下文：HTTP 客户端、全局限制、限速器、任务位池、事件总线，
//! 以及与单个任务无关的文件操作（文件命名、预分配）。

use crate::config::DownloadConfig;
use crate::downloader::worker::sanitize_file_name;
use crate::downloader::{
    BandwidthLimiter, DownloadError, DownloadTask, EngineLimits, RedownloadMode, TaskSlotPool,
};
use crate::events::{DownloadEvent, EventBus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tracing::{debug, info};

/// 最多跟随的重定向次数
pub const MAX_REDIRECTS: usize = 5;

/// 链接跳转到网页时的处理决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectDecision {
    /// 用新的链接继续下载
    Replace(String),
    /// 放弃，任务停留在 redirect 状态
    Abort,
}

/// 网页跳转解析器（例如让用户在浏览器里完成登录后给出真实链接）
#[async_trait]
pub trait RedirectResolver: Send + Sync {
    async fn resolve(&self, download_id: &str, page_url: &str) -> RedirectDecision;
}

/// 下载引擎
pub struct DownloadEngine {
    pub(crate) client: Client,
    pub(crate) limits: Arc<EngineLimits>,
    pub(crate) limiter: Arc<BandwidthLimiter>,
    pub(crate) slots: Arc<TaskSlotPool>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) resolver: Option<Arc<dyn RedirectResolver>>,
    config: RwLock<DownloadConfig>,
    /// 所有任务累计落盘的字节数（全局速度统计用）
    transferred: AtomicU64,
}

impl DownloadEngine {
    pub fn new(
        config: DownloadConfig,
        resolver: Option<Arc<dyn RedirectResolver>>,
    ) -> Result<Self> {
        let client = create_download_client()?;
        info!(
            "创建下载引擎: 最大同时下载数={}, 单任务分片数={}, 限速={} bytes/s",
            config.max_parallel_downloads, config.max_chunks, config.max_bandwidth
        );

        Ok(Self {
            client,
            limits: Arc::new(EngineLimits::from_config(&config)),
            limiter: Arc::new(BandwidthLimiter::new(config.max_bandwidth)),
            slots: Arc::new(TaskSlotPool::new(config.max_parallel_downloads)),
            events: Arc::new(EventBus::new()),
            resolver,
            config: RwLock::new(config),
            transferred: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> DownloadConfig {
        self.config.read().clone()
    }

    /// 重新应用配置（限速、分片、任务位立即生效）
    pub async fn apply_config(&self, config: DownloadConfig) {
        self.limits.apply(&config);
        self.limiter.set_limit(config.max_bandwidth);
        self.slots.resize(config.max_parallel_downloads).await;
        *self.config.write() = config;
    }

    pub(crate) fn publish(&self, event: DownloadEvent) {
        self.events.publish(event);
    }

    pub(crate) fn record_transferred(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }
}

/// 创建下载专用的 HTTP 客户端
///
/// 不设置整体超时（大分片可能需要很久），停滞由 worker 自己检测
pub fn create_download_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("mirror-dl/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(32)
        .pool_idle_timeout(Duration::from_secs(90)) // IdleConnTimeout: 90s
        .tcp_keepalive(Duration::from_secs(60))
        .tcp_nodelay(true)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .build()
        .context("创建下载 HTTP 客户端失败")
}

/// 准备输出文件
///
/// `truncate` 为 true 时新建（或清空）文件并预分配 `size`；
/// 否则只确认已有文件存在（断点续传）
pub async fn prepare_file(path: &Path, size: Option<u64>, truncate: bool) -> Result<(), DownloadError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::Disk(format!("创建父目录失败: {}", e)))?;
    }

    if !truncate {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| DownloadError::Disk(format!("检查文件失败: {}", e)))?;
        if exists {
            return Ok(());
        }
    }

    let file = File::create(path)
        .await
        .map_err(|e| DownloadError::Disk(format!("创建文件失败: {}", e)))?;
    if let Some(size) = size {
        file.set_len(size)
            .await
            .map_err(|e| DownloadError::Disk(format!("预分配文件空间失败: {}", e)))?;
    }

    info!("文件准备完成: {:?}, 大小: {:?} bytes", path, size);
    Ok(())
}

/// 链接路径的最后一段（百分号解码）
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let decoded = urlencoding::decode(segment).ok()?;
    sanitize_file_name(&decoded)
}

/// 确定文件名：调用方指定 > Content-Disposition > 链接 > name_hint > 任务ID
pub fn resolve_file_name(task: &DownloadTask, disposition: Option<&str>, final_url: &str) -> String {
    task.options
        .file_name
        .as_deref()
        .and_then(sanitize_file_name)
        .or_else(|| disposition.and_then(sanitize_file_name))
        .or_else(|| file_name_from_url(final_url))
        .or_else(|| task.urls.first().and_then(|u| file_name_from_url(u)))
        .or_else(|| task.options.name_hint.as_deref().and_then(sanitize_file_name))
        .unwrap_or_else(|| task.id.clone())
}

/// 按重下载策略处理已存在的同名文件，返回最终文件名
pub async fn apply_redownload(
    dir: &Path,
    name: &str,
    mode: RedownloadMode,
) -> Result<String, DownloadError> {
    let exists = |p: PathBuf| async move { tokio::fs::try_exists(p).await.unwrap_or(false) };

    if !exists(dir.join(name)).await {
        return Ok(name.to_string());
    }

    match mode {
        RedownloadMode::Never => Err(DownloadError::AlreadyExists(name.to_string())),
        RedownloadMode::Replace => {
            debug!("覆盖已有文件: {}", name);
            Ok(name.to_string())
        }
        RedownloadMode::Always => {
            let (stem, ext) = match name.rsplit_once('.') {
                Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
                _ => (name, None),
            };
            for n in 1u32.. {
                let candidate = match ext {
                    Some(ext) => format!("{}.{}.{}", stem, n, ext),
                    None => format!("{}.{}", stem, n),
                };
                if !exists(dir.join(&candidate)).await {
                    debug!("文件已存在，改用新文件名: {}", candidate);
                    return Ok(candidate);
                }
            }
            Err(DownloadError::AlreadyExists(name.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::DownloadOptions;
    use tempfile::TempDir;

    fn task_with(urls: &[&str], options: DownloadOptions) -> DownloadTask {
        DownloadTask::new(
            urls.iter().map(|u| u.to_string()).collect(),
            PathBuf::from("downloads"),
            options,
        )
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            file_name_from_url("https://a.example.com/files/My%20Game.zip?token=1"),
            Some("My Game.zip".to_string())
        );
        assert_eq!(file_name_from_url("https://a.example.com/"), None);
        assert_eq!(file_name_from_url("not a url"), None);
    }

    #[test]
    fn test_resolve_file_name_priority() {
        let options = DownloadOptions {
            name_hint: Some("hint.bin".to_string()),
            ..Default::default()
        };
        let task = task_with(&["https://m.example.com/dl/archive.7z"], options);

        assert_eq!(
            resolve_file_name(&task, Some("from-header.7z"), "https://m.example.com/dl/archive.7z"),
            "from-header.7z"
        );
        assert_eq!(
            resolve_file_name(&task, None, "https://cdn.example.com/real.7z"),
            "real.7z"
        );

        let task = task_with(&["https://m.example.com/"], task.options.clone());
        assert_eq!(resolve_file_name(&task, None, "https://m.example.com/"), "hint.bin");

        let explicit = DownloadOptions {
            file_name: Some("chosen.zip".to_string()),
            ..Default::default()
        };
        let task = task_with(&["https://m.example.com/x.zip"], explicit);
        assert_eq!(resolve_file_name(&task, Some("other.zip"), "https://m.example.com/x.zip"), "chosen.zip");

        let bare = task_with(&["https://m.example.com/"], DownloadOptions::default());
        assert_eq!(resolve_file_name(&bare, None, "https://m.example.com/"), bare.id);
    }

    #[tokio::test]
    async fn test_apply_redownload() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            apply_redownload(dir.path(), "a.zip", RedownloadMode::Never).await.unwrap(),
            "a.zip"
        );

        tokio::fs::write(dir.path().join("a.zip"), b"x").await.unwrap();
        assert!(matches!(
            apply_redownload(dir.path(), "a.zip", RedownloadMode::Never).await,
            Err(DownloadError::AlreadyExists(_))
        ));
        assert_eq!(
            apply_redownload(dir.path(), "a.zip", RedownloadMode::Replace).await.unwrap(),
            "a.zip"
        );
        assert_eq!(
            apply_redownload(dir.path(), "a.zip", RedownloadMode::Always).await.unwrap(),
            "a.1.zip"
        );

        tokio::fs::write(dir.path().join("a.1.zip"), b"x").await.unwrap();
        assert_eq!(
            apply_redownload(dir.path(), "a.zip", RedownloadMode::Always).await.unwrap(),
            "a.2.zip"
        );
    }

    #[tokio::test]
    async fn test_prepare_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("out.bin");

        prepare_file(&path, Some(4096), true).await.unwrap();
        assert_eq!(tokio::fs::metadata(&path).await.unwrap().len(), 4096);

        // 续传时保留已有内容
        tokio::fs::write(&path, b"partial").await.unwrap();
        prepare_file(&path, Some(4096), false).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"partial");

        let unsized_path = dir.path().join("unsized.bin");
        prepare_file(&unsized_path, None, true).await.unwrap();
        assert_eq!(tokio::fs::metadata(&unsized_path).await.unwrap().len(), 0);
    }
}
