use crate::config::DownloadConfig;
use crate::downloader::coordinator::{validate_url, Command, Coordinator, Reply};
use crate::downloader::{
    ChunkStore, ControlError, DownloadEngine, DownloadOptions, DownloadState, DownloadTask,
    RedirectResolver, SpeedTracker,
};
use crate::events::DownloadEvent;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 管理器持有的单个任务句柄
struct DownloadHandle {
    /// 协调器发布的任务快照
    snapshot: watch::Receiver<DownloadTask>,
    commands: mpsc::UnboundedSender<Command>,
    join: JoinHandle<()>,
}

/// 恢复任务后需要补发的命令
enum Restart {
    None,
    Start,
    Resume,
}

/// 下载管理器
///
/// 对外的唯一入口。每个任务由一个协调器任务驱动，管理器只转发命令、
/// 读取快照，以及统计全局速度。
pub struct DownloadManager {
    engine: Arc<DownloadEngine>,
    /// 所有任务（task_id -> 句柄）
    tasks: RwLock<HashMap<String, DownloadHandle>>,
    /// 全局速度（所有任务合计）
    speed: Arc<Mutex<SpeedTracker>>,
    /// 关闭时取消所有协调器
    shutdown: CancellationToken,
}

impl DownloadManager {
    pub fn new(config: DownloadConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// 带网页跳转解析器的管理器
    pub fn with_redirect_resolver(
        config: DownloadConfig,
        resolver: Arc<dyn RedirectResolver>,
    ) -> Result<Self> {
        Self::build(config, Some(resolver))
    }

    fn build(config: DownloadConfig, resolver: Option<Arc<dyn RedirectResolver>>) -> Result<Self> {
        config.validate().context("下载配置无效")?;
        let history_len = config.speed_history_len;
        let engine = Arc::new(DownloadEngine::new(config, resolver)?);
        let speed = Arc::new(Mutex::new(SpeedTracker::new(history_len)));
        let shutdown = CancellationToken::new();

        spawn_speed_sampler(engine.clone(), speed.clone(), shutdown.clone());
        info!("下载管理器已启动");

        Ok(Self {
            engine,
            tasks: RwLock::new(HashMap::new()),
            speed,
            shutdown,
        })
    }

    /// 创建下载任务，返回任务ID
    ///
    /// 除非 `options.start_paused`，任务会在拿到任务位后自动开始
    pub async fn enqueue(&self, urls: Vec<String>, options: DownloadOptions) -> Result<String> {
        let urls = normalize_urls(urls)?;
        let start_paused = options.start_paused;
        let task = DownloadTask::new(urls, self.engine.config().download_dir, options);
        let id = task.id.clone();

        info!("创建下载任务: id={}, 链接数={}", id, task.urls.len());
        self.spawn_task(task, None).await;

        if !start_paused {
            self.start(&id).await?;
        }
        Ok(id)
    }

    /// 从持久化记录恢复任务
    ///
    /// 运行中的任务恢复为暂停后自动续传；无法续传的任务从头开始
    pub async fn restore(&self, mut task: DownloadTask) -> Result<String> {
        if self.tasks.read().await.contains_key(&task.id) {
            anyhow::bail!("任务 {} 已存在，无法恢复", task.id);
        }
        task.urls = normalize_urls(std::mem::take(&mut task.urls))?;

        let store = match (task.size, task.chunks.take()) {
            (Some(size), Some(chunks)) if task.state != DownloadState::Finished => {
                match ChunkStore::from_outstanding(size, chunks) {
                    Ok(store) => Some(store),
                    Err(e) => {
                        warn!("任务 {} 的分片记录无效，将重新下载: {}", task.id, e);
                        None
                    }
                }
            }
            _ => None,
        };
        if let Some(store) = &store {
            task.received = store.received();
        }
        if task.state != DownloadState::Finished {
            task.verified = 0;
        }

        let state = task.state;
        let (store, restart) = match state {
            DownloadState::Started | DownloadState::Finalizing => {
                let resumable = store
                    .as_ref()
                    .is_some_and(|s| task.pausable || s.is_complete());
                if resumable {
                    task.state = DownloadState::Paused;
                    (store, Restart::Resume)
                } else {
                    task.state = DownloadState::Init;
                    task.received = 0;
                    task.size = None;
                    (None, Restart::Start)
                }
            }
            DownloadState::Init if !task.options.start_paused => (store, Restart::Start),
            _ => (store, Restart::None),
        };

        let id = task.id.clone();
        info!("恢复下载任务: id={}, 状态={}", id, task.state);
        self.spawn_task(task, store).await;

        match restart {
            Restart::Start => self.start(&id).await?,
            Restart::Resume => self.resume(&id).await?,
            Restart::None => {}
        }
        Ok(id)
    }

    async fn spawn_task(&self, task: DownloadTask, store: Option<ChunkStore>) {
        self.engine.publish(DownloadEvent::Created {
            download_id: task.id.clone(),
            urls: task.urls.clone(),
        });

        let id = task.id.clone();
        let (snapshot, commands, join) =
            Coordinator::spawn(self.engine.clone(), task, store, self.shutdown.child_token());
        self.tasks.write().await.insert(
            id,
            DownloadHandle {
                snapshot,
                commands,
                join,
            },
        );
    }

    async fn send_command<F>(&self, id: &str, make: F) -> Result<()>
    where
        F: FnOnce(Reply) -> Command,
    {
        let commands = self
            .tasks
            .read()
            .await
            .get(id)
            .map(|h| h.commands.clone())
            .ok_or_else(|| ControlError::NotFound(id.to_string()))?;

        let (tx, rx) = oneshot::channel();
        commands
            .send(make(tx))
            .map_err(|_| ControlError::Shutdown)?;
        rx.await.map_err(|_| ControlError::Shutdown)??;
        Ok(())
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        self.send_command(id, Command::Start).await
    }

    /// 暂停任务；已暂停时什么也不做
    pub async fn pause(&self, id: &str) -> Result<()> {
        self.send_command(id, Command::Pause).await
    }

    /// 恢复任务；正在下载时什么也不做
    pub async fn resume(&self, id: &str) -> Result<()> {
        self.send_command(id, Command::Resume).await
    }

    /// 取消任务：停止所有连接，删除未完成的文件，不再跟踪
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let handle = self
            .tasks
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ControlError::NotFound(id.to_string()))?;

        let (tx, rx) = oneshot::channel();
        if handle.commands.send(Command::Cancel(tx)).is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = handle.join.await {
            warn!("协调器异常退出: {}, {}", id, e);
        }
        Ok(())
    }

    /// 确认已完成的任务，不再跟踪（文件保留）
    pub async fn acknowledge(&self, id: &str) -> Result<()> {
        self.send_command(id, Command::Acknowledge).await?;
        if let Some(handle) = self.tasks.write().await.remove(id) {
            let _ = handle.join.await;
        }
        Ok(())
    }

    /// 为停在 redirect 的任务提供真实下载链接
    pub async fn resolve_redirect(&self, id: &str, url: &str) -> Result<()> {
        let url = url.to_string();
        self.send_command(id, |reply| Command::ResolveRedirect(url, reply))
            .await
    }

    /// 追加镜像链接（排在已有链接之后）
    pub async fn add_urls(&self, id: &str, urls: Vec<String>) -> Result<()> {
        for url in &urls {
            validate_url(url)?;
        }
        self.send_command(id, |reply| Command::AddUrls(urls, reply))
            .await
    }

    /// 调整全局限制，None 表示保持不变
    pub async fn set_global_limits(
        &self,
        max_parallel_downloads: Option<usize>,
        max_chunks: Option<usize>,
        max_bandwidth: Option<u64>,
    ) -> Result<()> {
        let mut config = self.engine.config();
        if let Some(n) = max_parallel_downloads {
            config.max_parallel_downloads = n;
        }
        if let Some(n) = max_chunks {
            config.max_chunks = n;
        }
        if let Some(n) = max_bandwidth {
            config.max_bandwidth = n;
        }
        self.apply_config(config).await
    }

    /// 重新应用下载配置，对正在进行的任务立即生效
    pub async fn apply_config(&self, config: DownloadConfig) -> Result<()> {
        config.validate().context("下载配置无效")?;
        self.speed.lock().set_capacity(config.speed_history_len);
        self.engine.apply_config(config).await;

        for handle in self.tasks.read().await.values() {
            let _ = handle.commands.send(Command::Nudge);
        }
        debug!("下载配置已更新");
        Ok(())
    }

    pub fn config(&self) -> DownloadConfig {
        self.engine.config()
    }

    pub async fn get_task(&self, id: &str) -> Option<DownloadTask> {
        self.tasks
            .read()
            .await
            .get(id)
            .map(|h| h.snapshot.borrow().clone())
    }

    /// 所有任务，按创建时间排序
    pub async fn get_all_tasks(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<DownloadTask> = self
            .tasks
            .read()
            .await
            .values()
            .map(|h| h.snapshot.borrow().clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// 订阅所有任务的事件
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DownloadEvent> {
        self.engine.events.subscribe()
    }

    /// 全局下载速度 (bytes/s)
    pub fn speed(&self) -> u64 {
        self.speed.lock().speed()
    }

    /// 全局速度历史，最旧的在前
    pub fn speed_history(&self) -> Vec<u64> {
        self.speed.lock().history()
    }

    /// 停止所有任务（不删除文件），等待协调器退出
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<DownloadHandle> = self.tasks.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.join.await;
        }
        info!("下载管理器已关闭");
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        // 所有协调器都是 shutdown 的子令牌
        self.shutdown.cancel();
    }
}

/// 校验并去重链接，保持原有顺序
fn normalize_urls(urls: Vec<String>) -> Result<Vec<String>, ControlError> {
    if urls.is_empty() {
        return Err(ControlError::EmptyUrls);
    }
    let mut unique: Vec<String> = Vec::with_capacity(urls.len());
    for url in urls {
        let url = url.trim().to_string();
        validate_url(&url)?;
        if !unique.contains(&url) {
            unique.push(url);
        }
    }
    Ok(unique)
}

fn spawn_speed_sampler(
    engine: Arc<DownloadEngine>,
    speed: Arc<Mutex<SpeedTracker>>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        speed.lock().rebase(engine.transferred());
        loop {
            let interval = engine.config().sample_interval();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    speed.lock().sample(engine.transferred());
                }
            }
        }
    });
}
