use anyhow::{Context, Result};
use clap::Parser;
use mirror_downloader::{
    logging, AppConfig, DownloadEvent, DownloadManager, DownloadOptions, DownloadState,
    ExpectedDigest, RedownloadMode,
};
use std::path::PathBuf;
use tracing::{error, info, warn};

/// 配置文件默认路径
const CONFIG_PATH: &str = "config/app.toml";

/// 从一个或多个镜像分片下载同一个文件
#[derive(Debug, Parser)]
#[command(name = "mirror-dl", version, about)]
struct Cli {
    /// 镜像链接，按优先级排列
    #[arg(required = true)]
    urls: Vec<String>,

    /// 下载目录（默认取配置文件）
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// 保存的文件名
    #[arg(short, long)]
    output: Option<String>,

    /// 期望的 MD5
    #[arg(long, conflicts_with = "sha256")]
    md5: Option<String>,

    /// 期望的 SHA-256
    #[arg(long)]
    sha256: Option<String>,

    /// Referer 请求头
    #[arg(long)]
    referer: Option<String>,

    /// 覆盖已存在的同名文件（默认改名保存）
    #[arg(long)]
    overwrite: bool,

    /// 单任务最大分片数
    #[arg(long)]
    max_chunks: Option<usize>,

    /// 限速（bytes/s，0 为不限速）
    #[arg(long)]
    max_bandwidth: Option<u64>,

    /// 配置文件路径
    #[arg(long, default_value = CONFIG_PATH)]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
        AppConfig::load_from_file(&cli.config).await?
    } else {
        AppConfig::default()
    };
    let _log_guard = logging::init_logging(&config.log);

    if let Some(dir) = cli.dir.clone() {
        config.download.download_dir = dir;
    }
    if let Some(n) = cli.max_chunks {
        config.download.max_chunks = n;
    }
    if let Some(n) = cli.max_bandwidth {
        config.download.max_bandwidth = n;
    }

    let manager = DownloadManager::new(config.download).context("创建下载管理器失败")?;
    let mut events = manager.subscribe();

    let options = DownloadOptions {
        file_name: cli.output.clone(),
        referer: cli.referer.clone(),
        redownload: if cli.overwrite {
            RedownloadMode::Replace
        } else {
            RedownloadMode::Always
        },
        expected_digest: cli
            .md5
            .clone()
            .map(ExpectedDigest::Md5)
            .or_else(|| cli.sha256.clone().map(ExpectedDigest::Sha256)),
        ..Default::default()
    };
    let id = manager.enqueue(cli.urls.clone(), options).await?;
    info!("开始下载: {}", id);

    let final_state = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("收到中断信号，停止下载");
                manager.shutdown().await;
                break None;
            }
            event = events.recv() => {
                let Some(event) = event else { break None };
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("事件序列化失败: {}", e),
                }
                if let DownloadEvent::StateChanged { new_state, .. } = event {
                    if new_state.is_terminal() {
                        break Some(new_state);
                    }
                }
            }
        }
    };

    let task = manager.get_task(&id).await;
    match (final_state, task) {
        (Some(DownloadState::Finished), Some(task)) => {
            info!(
                "✅ 下载完成: {:?}, md5={}",
                task.output_path(),
                task.file_md5.unwrap_or_default()
            );
            manager.acknowledge(&id).await?;
            Ok(())
        }
        (Some(state), task) => {
            let cause = task
                .and_then(|t| t.fail_cause)
                .map(|c| c.message)
                .unwrap_or_default();
            error!("下载未完成: 状态={}, 原因={}", state, cause);
            anyhow::bail!("下载未完成: {}", state)
        }
        (None, _) => Ok(()),
    }
}
