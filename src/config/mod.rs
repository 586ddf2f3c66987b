// 配置管理模块

use crate::downloader::chunk::DEFAULT_MIN_CHUNK_SIZE;
use crate::downloader::progress::{DEFAULT_HISTORY_LEN, DEFAULT_SAMPLE_INTERVAL};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 下载配置
///
/// 除 `download_dir` 外都可以在运行时通过 `DownloadManager::apply_config` 重新应用
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadConfig {
    /// 默认下载目录
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 最小分片大小（字节）
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,
    /// 单个任务最多同时下载的分片数
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    /// 最大同时下载任务数
    #[serde(default = "default_max_parallel_downloads")]
    pub max_parallel_downloads: usize,
    /// 全局限速（bytes/s，0 表示不限速）
    #[serde(default)]
    pub max_bandwidth: u64,
    /// 单个分片的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 单个连接多久没有数据视为停滞（秒）
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    /// 整个任务多久没有任何进度视为失败（秒）
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    /// 速度采样间隔（毫秒）
    #[serde(default = "default_speed_sample_interval_ms")]
    pub speed_sample_interval_ms: u64,
    /// 保留的速度样本数
    #[serde(default = "default_speed_history_len")]
    pub speed_history_len: usize,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_min_chunk_size() -> u64 {
    DEFAULT_MIN_CHUNK_SIZE
}

fn default_max_chunks() -> usize {
    4
}

fn default_max_parallel_downloads() -> usize {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_stall_timeout_secs() -> u64 {
    30
}

fn default_download_timeout_secs() -> u64 {
    120
}

fn default_speed_sample_interval_ms() -> u64 {
    DEFAULT_SAMPLE_INTERVAL.as_millis() as u64
}

fn default_speed_history_len() -> usize {
    DEFAULT_HISTORY_LEN
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            min_chunk_size: default_min_chunk_size(),
            max_chunks: default_max_chunks(),
            max_parallel_downloads: default_max_parallel_downloads(),
            max_bandwidth: 0,
            max_retries: default_max_retries(),
            stall_timeout_secs: default_stall_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
            speed_sample_interval_ms: default_speed_sample_interval_ms(),
            speed_history_len: default_speed_history_len(),
        }
    }
}

impl DownloadConfig {
    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.download_dir.as_os_str().is_empty() {
            anyhow::bail!("下载目录不能为空");
        }
        if self.min_chunk_size == 0 {
            anyhow::bail!("最小分片大小必须大于 0");
        }
        if self.max_chunks == 0 {
            anyhow::bail!("单任务最大分片数必须大于 0");
        }
        if self.max_parallel_downloads == 0 {
            anyhow::bail!("最大同时下载任务数必须大于 0");
        }
        if self.stall_timeout_secs == 0 || self.download_timeout_secs == 0 {
            anyhow::bail!("超时时间必须大于 0");
        }
        if self.download_timeout_secs < self.stall_timeout_secs {
            anyhow::bail!(
                "任务超时 ({}s) 不能小于连接停滞超时 ({}s)",
                self.download_timeout_secs,
                self.stall_timeout_secs
            );
        }
        if self.speed_sample_interval_ms == 0 || self.speed_history_len == 0 {
            anyhow::bail!("速度采样间隔和样本数必须大于 0");
        }
        Ok(())
    }

    pub fn sample_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.speed_sample_interval_ms)
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .download
            .validate()
            .context("配置文件中的下载配置无效")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.download
            .validate()
            .context("保存配置失败：下载配置无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载配置，失败时使用默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.download.min_chunk_size, 1024 * 1024);
        assert_eq!(config.download.max_chunks, 4);
        assert_eq!(config.download.max_parallel_downloads, 1);
        assert_eq!(config.download.max_bandwidth, 0);
        assert_eq!(config.download.speed_history_len, 30);
        assert!(config.download.validate().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.download.max_chunks = 8;
        config.download.max_bandwidth = 512 * 1024;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.download, config.download);
        assert_eq!(loaded.log.level, "info");
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        tokio::fs::write(path, "[download]\nmax_chunks = 2\n")
            .await
            .unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.download.max_chunks, 2);
        assert_eq!(loaded.download.max_retries, 3);
        assert!(loaded.log.enabled);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        tokio::fs::write(path, "[download]\nmax_chunks = 0\n")
            .await
            .unwrap();

        assert!(AppConfig::load_from_file(path).await.is_err());
        let fallback = AppConfig::load_or_default(path).await;
        assert_eq!(fallback.download.max_chunks, 4);
    }

    #[test]
    fn test_validate_timeouts() {
        let mut config = DownloadConfig::default();
        config.download_timeout_secs = 10;
        config.stall_timeout_secs = 30;
        assert!(config.validate().is_err());
    }
}
