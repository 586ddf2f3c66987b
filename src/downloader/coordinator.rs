//! 单任务协调器
//!
//! 每个下载任务一个 tokio 任务，是该任务记录和分片存储的唯一修改者。
//! 协调器在一个 `select!` 循环里处理三类输入：
//! 1. 控制命令（开始、暂停、恢复、取消、确认、追加链接、网页跳转替换）
//! 2. worker 消息和内部信号（任务位到手、校验结果、跳转解析结果）
//! 3. 采样时钟（速度统计、进度事件、任务级超时、退避到期后的重新调度）
//!
//! 对外只通过 `watch` 通道发布任务快照，读取方从不接触协调器内部状态。

use crate::downloader::engine::{apply_redownload, prepare_file, resolve_file_name};
use crate::downloader::verifier::{verify_file, VerifyOutcome};
use crate::downloader::worker::{ProbePlan, ResponseInfo, TransferWorker, WorkerEvent, WorkerId};
use crate::downloader::{
    Chunk, ChunkScheduler, ChunkStore, ControlError, DownloadEngine, DownloadError,
    DownloadState, DownloadTask, FailCause, FailKind, LeaseId, RedirectDecision, RetryDecision,
    SpeedTracker,
};
use crate::events::DownloadEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) type Reply = oneshot::Sender<Result<(), ControlError>>;

/// 发给协调器的控制命令
#[derive(Debug)]
pub(crate) enum Command {
    Start(Reply),
    Pause(Reply),
    Resume(Reply),
    Cancel(Reply),
    Acknowledge(Reply),
    ResolveRedirect(String, Reply),
    AddUrls(Vec<String>, Reply),
    /// 全局限制变化后重新调度
    Nudge,
}

/// 协调器内部信号
#[derive(Debug)]
enum Signal {
    SlotAcquired,
    Verified(Result<VerifyOutcome, DownloadError>),
    Redirect(RedirectDecision),
}

struct ActiveWorker {
    lease: Option<LeaseId>,
    url_index: usize,
    handle: JoinHandle<()>,
}

/// 协调器退出方式
enum Exit {
    /// 继续运行
    Continue,
    /// 任务已移除，停止循环
    Removed,
}

pub(crate) struct Coordinator {
    engine: Arc<DownloadEngine>,
    task: DownloadTask,
    store: Option<ChunkStore>,
    scheduler: ChunkScheduler,
    speed: SpeedTracker,
    snapshot: watch::Sender<DownloadTask>,

    commands: mpsc::UnboundedReceiver<Command>,
    worker_tx: mpsc::UnboundedSender<WorkerEvent>,
    worker_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    signal_rx: mpsc::UnboundedReceiver<Signal>,

    /// 任务级令牌（管理器关闭时取消）
    token: CancellationToken,
    /// 本轮运行的令牌，暂停/失败时取消
    run: Option<CancellationToken>,
    /// 等待任务位的令牌
    slot_wait: Option<CancellationToken>,
    has_slot: bool,

    workers: HashMap<WorkerId, ActiveWorker>,
    next_worker: u64,
    /// 探测请求的重试记录
    probe: Chunk,
    probe_retry_at: Option<Instant>,
    /// 大小未知，单连接读到结束
    unbounded: bool,
    /// 本次会话中服务器拒绝过 Range
    range_refused: bool,
    /// 上一次收到任何进度的时间
    last_progress: Instant,
    verified: Arc<AtomicU64>,
}

impl Coordinator {
    /// 创建协调器并在后台运行，返回快照接收端、命令发送端和 JoinHandle
    pub(crate) fn spawn(
        engine: Arc<DownloadEngine>,
        task: DownloadTask,
        store: Option<ChunkStore>,
        token: CancellationToken,
    ) -> (
        watch::Receiver<DownloadTask>,
        mpsc::UnboundedSender<Command>,
        JoinHandle<()>,
    ) {
        let config = engine.config();
        let (snapshot_tx, snapshot_rx) = watch::channel(task.clone());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let scheduler = ChunkScheduler::new(engine.limits.clone(), task.urls.len());
        let speed = SpeedTracker::with_start(config.speed_history_len, task.received, Instant::now());

        let coordinator = Coordinator {
            engine,
            task,
            store,
            scheduler,
            speed,
            snapshot: snapshot_tx,
            commands: command_rx,
            worker_tx,
            worker_rx,
            signal_tx,
            signal_rx,
            token,
            run: None,
            slot_wait: None,
            has_slot: false,
            workers: HashMap::new(),
            next_worker: 1,
            probe: Chunk::new(0, 0, 0),
            probe_retry_at: None,
            unbounded: false,
            range_refused: false,
            last_progress: Instant::now(),
            verified: Arc::new(AtomicU64::new(0)),
        };

        let handle = tokio::spawn(coordinator.run(config.sample_interval()));
        (snapshot_rx, command_tx, handle)
    }

    async fn run(mut self, sample_interval: std::time::Duration) {
        let mut tick = tokio::time::interval(sample_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        self.publish_snapshot();

        loop {
            let exit = tokio::select! {
                _ = self.token.cancelled() => {
                    self.shutdown().await;
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = self.worker_rx.recv() => {
                    self.handle_worker_event(event).await;
                    Exit::Continue
                }
                Some(signal) = self.signal_rx.recv() => {
                    self.handle_signal(signal).await;
                    Exit::Continue
                }
                _ = tick.tick() => {
                    self.on_tick().await;
                    Exit::Continue
                }
            };

            if matches!(exit, Exit::Removed) {
                break;
            }
        }

        debug!("协调器退出: {}", self.task.id);
    }

    // ---------- 控制命令 ----------

    async fn handle_command(&mut self, command: Command) -> Exit {
        match command {
            Command::Start(reply) => {
                let result = self.start();
                let _ = reply.send(result);
            }
            Command::Pause(reply) => {
                let result = self.pause().await;
                let _ = reply.send(result);
            }
            Command::Resume(reply) => {
                let result = self.resume();
                let _ = reply.send(result);
            }
            Command::Cancel(reply) => {
                self.cancel().await;
                let _ = reply.send(Ok(()));
                return Exit::Removed;
            }
            Command::Acknowledge(reply) => {
                if self.task.state != DownloadState::Finished {
                    let _ = reply.send(Err(ControlError::InvalidState(self.task.state)));
                    return Exit::Continue;
                }
                info!("任务已确认完成，移除: {}", self.task.id);
                self.engine.publish(DownloadEvent::Removed {
                    download_id: self.task.id.clone(),
                });
                let _ = reply.send(Ok(()));
                return Exit::Removed;
            }
            Command::ResolveRedirect(url, reply) => {
                let result = self.resolve_redirect(url);
                let _ = reply.send(result);
            }
            Command::AddUrls(urls, reply) => {
                self.add_urls(urls);
                let _ = reply.send(Ok(()));
            }
            Command::Nudge => self.schedule().await,
        }
        Exit::Continue
    }

    fn start(&mut self) -> Result<(), ControlError> {
        match self.task.state {
            DownloadState::Init => {
                self.request_slot();
                Ok(())
            }
            DownloadState::Started => Ok(()),
            state => Err(ControlError::InvalidState(state)),
        }
    }

    async fn pause(&mut self) -> Result<(), ControlError> {
        match self.task.state {
            DownloadState::Paused => {
                // 恢复后还在等待任务位时，取消等待
                self.cancel_slot_wait();
                Ok(())
            }
            DownloadState::Started => {
                if !self.task.pausable {
                    return Err(ControlError::NotPausable);
                }
                self.stop_run();
                self.transition(DownloadState::Paused);
                self.release_slot().await;
                info!("暂停下载任务: {}", self.task.id);
                Ok(())
            }
            state => Err(ControlError::InvalidState(state)),
        }
    }

    fn resume(&mut self) -> Result<(), ControlError> {
        match self.task.state {
            DownloadState::Started => Ok(()),
            DownloadState::Init | DownloadState::Paused => {
                self.request_slot();
                Ok(())
            }
            DownloadState::Failed | DownloadState::Redirect => {
                self.reset_for_restart();
                self.request_slot();
                Ok(())
            }
            state => Err(ControlError::InvalidState(state)),
        }
    }

    /// failed / redirect 重新开始前的清理
    fn reset_for_restart(&mut self) {
        let corrupt = self
            .task
            .fail_cause
            .as_ref()
            .is_some_and(|c| c.kind == FailKind::CorruptDownload);

        if corrupt || self.unbounded || (self.store.is_none() && self.task.received > 0) {
            info!("丢弃已下载的数据，重新下载: {}", self.task.id);
            self.store = None;
            self.task.received = 0;
            self.task.size = None;
            self.unbounded = false;
            self.speed.rebase(0);
        }
        if let Some(store) = self.store.as_mut() {
            store.reset_retries();
        }
        self.task.verified = 0;
        self.task.file_md5 = None;
        self.probe = Chunk::new(0, 0, 0);
        self.probe_retry_at = None;
        self.scheduler.reset();
    }

    fn resolve_redirect(&mut self, url: String) -> Result<(), ControlError> {
        if self.task.state != DownloadState::Redirect {
            return Err(ControlError::InvalidState(self.task.state));
        }
        validate_url(&url)?;
        info!("网页跳转已解析，使用新链接: {}", url);
        self.append_urls(vec![url.clone()]);
        if let Some(index) = self.task.urls.iter().position(|u| *u == url) {
            // 新链接优先
            self.probe = Chunk::new(0, 0, index);
        }
        self.request_slot();
        Ok(())
    }

    fn add_urls(&mut self, urls: Vec<String>) {
        let valid: Vec<String> = urls.into_iter().filter(|u| validate_url(u).is_ok()).collect();
        self.append_urls(valid);
        self.publish_snapshot();
    }

    fn append_urls(&mut self, urls: Vec<String>) {
        for url in urls {
            if !self.task.urls.contains(&url) {
                debug!("追加下载链接: {}", url);
                self.task.urls.push(url);
            }
        }
        self.scheduler.set_url_count(self.task.urls.len());
    }

    async fn cancel(&mut self) {
        self.cancel_slot_wait();
        self.abort_workers().await;
        self.stop_run();

        if self.task.state != DownloadState::Finished {
            if let Some(path) = self.task.output_path() {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => info!("已删除未完成的文件: {:?}", path),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("删除未完成的文件失败: {:?}, 错误: {}", path, e),
                }
            }
        }

        self.release_slot().await;
        info!("取消下载任务: {}", self.task.id);
        self.engine.publish(DownloadEvent::Removed {
            download_id: self.task.id.clone(),
        });
    }

    async fn shutdown(&mut self) {
        self.cancel_slot_wait();
        self.abort_workers().await;
        self.stop_run();
        self.release_slot().await;
        self.publish_snapshot();
    }

    // ---------- 任务位 ----------

    fn request_slot(&mut self) {
        if self.slot_wait.is_some() {
            return;
        }
        let wait = self.token.child_token();
        self.slot_wait = Some(wait.clone());

        let slots = self.engine.slots.clone();
        let id = self.task.id.clone();
        let tx = self.signal_tx.clone();
        tokio::spawn(async move {
            if slots.acquire(&id, &wait).await.is_some() && tx.send(Signal::SlotAcquired).is_err() {
                slots.release(&id).await;
            }
        });
        debug!("任务等待任务位: {}", self.task.id);
    }

    fn cancel_slot_wait(&mut self) {
        if let Some(wait) = self.slot_wait.take() {
            wait.cancel();
        }
    }

    async fn release_slot(&mut self) {
        if self.has_slot {
            self.engine.slots.release(&self.task.id).await;
            self.has_slot = false;
        }
    }

    async fn on_slot_acquired(&mut self) {
        if self.slot_wait.take().is_none() {
            // 等待期间被暂停/取消
            self.engine.slots.release(&self.task.id).await;
            return;
        }
        self.has_slot = true;

        if !self.transition(DownloadState::Started) {
            self.release_slot().await;
            return;
        }

        let run = self.token.child_token();
        self.run = Some(run);
        self.last_progress = Instant::now();
        self.speed.rebase(self.task.received);
        self.launch().await;
    }

    /// 进入 started 后开始工作：有分片存储就续传，否则先探测
    async fn launch(&mut self) {
        let resumable = self
            .store
            .as_ref()
            .map(|s| (s.size(), s.remaining(), s.is_complete()));

        if let (Some((size, remaining, complete)), Some(path)) = (resumable, self.task.output_path()) {
            let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
            if exists || size == 0 {
                if let Err(e) = prepare_file(&path, Some(size), false).await {
                    self.fail(e).await;
                    return;
                }
                info!("续传下载任务: {}, 剩余 {} bytes", self.task.id, remaining);
                self.scheduler.set_range_supported(self.task.pausable);
                if complete {
                    self.finalize().await;
                } else {
                    self.schedule().await;
                }
                return;
            }
            warn!("未找到已下载的文件，重新下载: {:?}", path);
        }

        self.store = None;
        self.task.received = 0;
        self.spawn_probe();
    }

    // ---------- worker ----------

    fn run_token(&mut self) -> CancellationToken {
        match &self.run {
            Some(run) => run.clone(),
            None => {
                let run = self.token.child_token();
                self.run = Some(run.clone());
                run
            }
        }
    }

    fn new_worker(&mut self, url_index: usize) -> TransferWorker {
        let id = WorkerId(self.next_worker);
        self.next_worker += 1;
        let cancel = self.run_token().child_token();
        TransferWorker {
            id,
            client: self.engine.client.clone(),
            url: self.task.urls[url_index].clone(),
            referer: self.task.options.referer.clone(),
            stall_timeout: self.engine.limits.stall_timeout(),
            limiter: self.engine.limiter.clone(),
            cancel,
            events: self.worker_tx.clone(),
        }
    }

    fn spawn_probe(&mut self) {
        let url_index = if self.probe.retries == 0 && self.scheduler.is_usable(self.probe.url_index) {
            Some(self.probe.url_index)
        } else {
            self.scheduler.select_url(&self.probe)
        };
        let Some(url_index) = url_index else {
            warn!("没有可用的下载链接: {}", self.task.id);
            return;
        };

        self.probe.url_index = url_index;
        self.probe_retry_at = None;
        let worker = self.new_worker(url_index);
        debug!("探测下载链接: {}", worker.url);
        let id = worker.id;
        let handle = worker.spawn_probe();
        self.workers.insert(
            id,
            ActiveWorker {
                lease: None,
                url_index,
                handle,
            },
        );
    }

    /// 按上限补足正在下载的分片
    async fn schedule(&mut self) {
        if self.task.state != DownloadState::Started || self.run.is_none() {
            return;
        }

        if self.store.is_none() {
            // 还没有分片存储：探测重试到期后重新探测
            let due = self.probe_retry_at.map_or(true, |t| t <= Instant::now());
            if self.workers.is_empty() && due {
                self.spawn_probe();
            }
            return;
        }
        let Some(path) = self.task.output_path() else {
            return;
        };
        let Some(store) = self.store.as_mut() else {
            return;
        };

        let max = self.scheduler.max_leases();
        let mut leases = Vec::new();
        let now = Instant::now();
        while self.workers.len() + leases.len() < max {
            let scheduler = &self.scheduler;
            match store.claim_next(now, |chunk| scheduler.select_url(chunk)) {
                Some(lease) => leases.push(lease),
                None => break,
            }
        }

        for lease in leases {
            let worker = self.new_worker(lease.url_index);
            let id = worker.id;
            let url_index = lease.url_index;
            let lease_id = lease.id;
            let handle = worker.spawn_fetch(lease, path.clone());
            self.workers.insert(
                id,
                ActiveWorker {
                    lease: Some(lease_id),
                    url_index,
                    handle,
                },
            );
        }
    }

    async fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Headers {
                worker,
                info,
                reply,
            } => {
                if self.workers.contains_key(&worker) {
                    self.on_headers(worker, info, reply).await;
                }
            }
            WorkerEvent::Progress { worker, bytes } => self.on_progress(worker, bytes),
            WorkerEvent::Finished { worker } => self.on_finished(worker).await,
            WorkerEvent::Failed { worker, error } => self.on_failed(worker, error).await,
        }
    }

    async fn on_headers(&mut self, worker: WorkerId, info: ResponseInfo, reply: oneshot::Sender<ProbePlan>) {
        debug!(
            "探测响应: status={}, size={:?}, range={}, url={}",
            info.status, info.total_size, info.range_supported, info.final_url
        );

        if self.task.local_path.is_none() {
            let name = resolve_file_name(&self.task, info.file_name.as_deref(), &info.final_url);
            match apply_redownload(&self.task.download_dir, &name, self.task.options.redownload).await {
                Ok(name) => {
                    info!("确定文件名: {}", name);
                    self.task.local_path = Some(name);
                }
                Err(e) => {
                    self.fail(e).await;
                    return;
                }
            }
        }
        let Some(path) = self.task.output_path() else {
            return;
        };

        if !info.range_supported {
            self.range_refused = true;
        }
        let ranged = info.range_supported && !self.range_refused;
        self.task.pausable = ranged && info.total_size.is_some();
        self.scheduler.set_range_supported(ranged);

        let url_index = self.probe.url_index;
        let (limit, lease) = match info.total_size {
            Some(size) => {
                self.task.size = Some(size);
                self.unbounded = false;
                let chunk_len = if ranged {
                    self.scheduler.chunk_len(size)
                } else {
                    size
                };
                let mut store = ChunkStore::new(size, chunk_len, url_index);
                let lease = store
                    .outstanding()
                    .first()
                    .map(|c| (c.offset, c.length))
                    .and_then(|(offset, length)| store.claim(offset, length, url_index).ok());
                self.task.received = 0;
                self.store = Some(store);
                (Some(lease.as_ref().map_or(0, |l| l.length)), lease)
            }
            None => {
                info!("文件大小未知，单连接下载到结束: {}", self.task.id);
                self.task.size = None;
                self.task.received = 0;
                self.store = None;
                self.unbounded = true;
                (None, None)
            }
        };

        if let Err(e) = prepare_file(&path, self.task.size, true).await {
            self.fail(e).await;
            return;
        }

        if let Some(active) = self.workers.get_mut(&worker) {
            active.lease = lease.map(|l| l.id);
            active.url_index = url_index;
        }
        let _ = reply.send(ProbePlan { path, limit });
        self.publish_snapshot();
        self.schedule().await;
    }

    fn on_progress(&mut self, worker: WorkerId, bytes: u64) {
        let Some(active) = self.workers.get(&worker) else {
            return;
        };

        match (active.lease, self.store.as_mut()) {
            (Some(lease), Some(store)) => {
                if let Err(e) = store.advance(lease, bytes) {
                    warn!("分片进度异常: {}", e);
                    return;
                }
                self.task.received = store.received();
            }
            _ => self.task.received += bytes,
        }
        self.engine.record_transferred(bytes);
        self.last_progress = Instant::now();
    }

    async fn on_finished(&mut self, worker: WorkerId) {
        let Some(active) = self.workers.remove(&worker) else {
            return;
        };

        if self.unbounded {
            self.task.size = Some(self.task.received);
            info!("下载完成（大小 {} bytes）: {}", self.task.received, self.task.id);
            self.finalize().await;
            return;
        }

        let Some(store) = self.store.as_mut() else {
            return;
        };
        if let Some(lease) = active.lease {
            match store.commit(lease) {
                Ok(bytes) if bytes > 0 => {
                    // worker 报告完成时所有字节都应已汇报
                    warn!("分片完成时仍有 {} bytes 未汇报", bytes);
                }
                Ok(_) => {}
                Err(e) => warn!("提交分片失败: {}", e),
            }
            self.task.received = store.received();
        }

        if store.is_complete() {
            self.finalize().await;
        } else {
            self.schedule().await;
        }
    }

    async fn on_failed(&mut self, worker: WorkerId, error: DownloadError) {
        let Some(active) = self.workers.remove(&worker) else {
            return;
        };

        match &error {
            DownloadError::RedirectedAway(_) => {
                self.scheduler.mark_failed(active.url_index);
                self.enter_redirect(error).await;
                return;
            }
            DownloadError::Disk(_) | DownloadError::AlreadyExists(_) => {
                self.fail(error).await;
                return;
            }
            DownloadError::RangeIgnored if self.store.is_some() => {
                self.fall_back_to_single_stream().await;
                return;
            }
            _ => {}
        }

        let decision = match (active.lease, self.store.is_some()) {
            (Some(lease), true) => self.release_failed_lease(lease, &error),
            _ => self.retry_probe(&error),
        };

        match decision {
            RetryDecision::Retry { delay } => {
                warn!(
                    "⚠️ 下载出错，{:?} 后换链接重试: {}, 错误: {}",
                    delay, self.task.id, error
                );
                if self.store.as_ref().is_some_and(|s| s.is_complete()) {
                    self.finalize().await;
                } else {
                    self.schedule().await;
                }
            }
            RetryDecision::Exhausted | RetryDecision::NoUsableUrl | RetryDecision::Fatal => {
                self.fail(error).await;
            }
        }
    }

    /// 服务器忽略 Range：放弃分片，单连接从头下载整个文件
    async fn fall_back_to_single_stream(&mut self) {
        let Some(size) = self.store.as_ref().map(|s| s.size()) else {
            return;
        };
        warn!("⚠️ 服务器忽略 Range 请求，改为单连接下载: {}", self.task.id);

        self.stop_run();
        self.run = Some(self.token.child_token());
        self.range_refused = true;
        self.task.pausable = false;
        self.scheduler.set_range_supported(false);

        let url_index = self.scheduler.first_url().unwrap_or(0);
        self.store = Some(ChunkStore::new(size, size, url_index));
        self.task.received = 0;
        self.speed.rebase(0);
        self.publish_snapshot();
        self.schedule().await;
    }

    /// 归还失败的租约，返回重试决定
    fn release_failed_lease(&mut self, lease: LeaseId, error: &DownloadError) -> RetryDecision {
        let Some(store) = self.store.as_mut() else {
            return RetryDecision::Fatal;
        };
        let Some(mut chunk) = store.lease_remaining(lease).cloned() else {
            return RetryDecision::Fatal;
        };

        let decision = self.scheduler.on_failure(&mut chunk, error);
        let not_before = match decision {
            RetryDecision::Retry { delay } if !delay.is_zero() => Some(Instant::now() + delay),
            _ => None,
        };

        if self.scheduler.range_supported() {
            if let Ok(Some(released)) = store.release(lease, not_before) {
                released.retries = chunk.retries;
                released.url_index = chunk.url_index;
            }
        } else {
            // 不支持 Range 时只能从头开始
            *store = restart_from_zero(store.size(), &chunk, not_before);
            self.task.received = 0;
        }
        decision
    }

    fn retry_probe(&mut self, error: &DownloadError) -> RetryDecision {
        if self.unbounded {
            // 单连接下载中断，只能从头再来
            self.task.received = 0;
            self.unbounded = false;
        }
        let mut probe = self.probe.clone();
        let decision = self.scheduler.on_failure(&mut probe, error);
        self.probe = probe;
        if let RetryDecision::Retry { delay } = decision {
            self.probe_retry_at = Some(Instant::now() + delay);
        }
        decision
    }

    async fn enter_redirect(&mut self, error: DownloadError) {
        self.stop_run();
        self.task.fail_cause = Some(FailCause::from(&error));
        warn!("⚠️ 链接跳转到了网页: {}, {}", self.task.id, error);
        self.transition(DownloadState::Redirect);
        self.release_slot().await;

        if let (Some(resolver), DownloadError::RedirectedAway(page)) =
            (self.engine.resolver.clone(), &error)
        {
            let id = self.task.id.clone();
            let page = page.clone();
            let tx = self.signal_tx.clone();
            let token = self.token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    decision = resolver.resolve(&id, &page) => {
                        let _ = tx.send(Signal::Redirect(decision));
                    }
                }
            });
        }
    }

    // ---------- 收尾 ----------

    async fn finalize(&mut self) {
        if !self.transition(DownloadState::Finalizing) {
            return;
        }
        self.stop_run();
        self.release_slot().await;

        let (Some(path), Some(size)) = (self.task.output_path(), self.task.size) else {
            self.fail(DownloadError::CorruptDownload("缺少文件路径或大小".to_string()))
                .await;
            return;
        };

        info!("所有分片下载完成，开始校验: {}", self.task.id);
        self.verified.store(0, Ordering::SeqCst);
        let expected = self.task.options.expected_digest.clone();
        let verified = self.verified.clone();
        let tx = self.signal_tx.clone();
        tokio::spawn(async move {
            let result = verify_file(path, size, expected, verified).await;
            let _ = tx.send(Signal::Verified(result));
        });
    }

    async fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::SlotAcquired => self.on_slot_acquired().await,
            Signal::Verified(result) => {
                if self.task.state != DownloadState::Finalizing {
                    return;
                }
                self.task.verified = self.verified.load(Ordering::SeqCst);
                match result {
                    Ok(outcome) => {
                        self.task.file_md5 = Some(outcome.md5);
                        self.store = None;
                        self.transition(DownloadState::Finished);
                        info!("✅ 下载完成: {}", self.task.id);
                    }
                    Err(e) => self.fail(e).await,
                }
            }
            Signal::Redirect(decision) => {
                if self.task.state != DownloadState::Redirect {
                    return;
                }
                match decision {
                    RedirectDecision::Replace(url) => {
                        if let Err(e) = self.resolve_redirect(url) {
                            warn!("跳转解析结果无效: {}", e);
                        }
                    }
                    RedirectDecision::Abort => {
                        info!("跳转解析被放弃，任务停留在 redirect: {}", self.task.id)
                    }
                }
            }
        }
    }

    async fn fail(&mut self, error: DownloadError) {
        self.stop_run();
        error!("❌ 下载失败: {}, 错误: {}", self.task.id, error);
        self.task.fail_cause = Some(FailCause::from(&error));
        self.transition(DownloadState::Failed);
        self.release_slot().await;
    }

    /// 取消本轮运行的所有 worker，归还租约
    fn stop_run(&mut self) {
        if let Some(run) = self.run.take() {
            run.cancel();
        }
        self.workers.clear();
        self.probe_retry_at = None;
        if let Some(store) = self.store.as_mut() {
            store.release_all();
        }
    }

    /// 中止并等待所有 worker 退出，之后不会再有写入
    async fn abort_workers(&mut self) {
        if let Some(run) = self.run.as_ref() {
            run.cancel();
        }
        for (_, worker) in self.workers.drain() {
            worker.handle.abort();
            let _ = worker.handle.await;
        }
    }

    // ---------- 采样 ----------

    async fn on_tick(&mut self) {
        match self.task.state {
            DownloadState::Started => {
                let speed = self.speed.sample(self.task.received);
                self.engine.publish(DownloadEvent::Progress {
                    download_id: self.task.id.clone(),
                    received: self.task.received,
                    size: self.task.size,
                    verified: self.task.verified,
                    speed,
                });

                let timeout = self.engine.limits.download_timeout();
                if self.run.is_some() && self.last_progress.elapsed() >= timeout {
                    self.fail(DownloadError::Stalled(timeout.as_secs())).await;
                    return;
                }

                if self.store.is_some() && self.workers.is_empty() && !self.scheduler.has_usable_url() {
                    self.fail(DownloadError::Network("没有可用的下载链接".to_string()))
                        .await;
                    return;
                }

                self.schedule().await;
            }
            DownloadState::Finalizing => {
                self.task.verified = self.verified.load(Ordering::SeqCst);
                self.engine.publish(DownloadEvent::Progress {
                    download_id: self.task.id.clone(),
                    received: self.task.received,
                    size: self.task.size,
                    verified: self.task.verified,
                    speed: 0,
                });
            }
            _ => {}
        }
        self.publish_snapshot();
    }

    // ---------- 状态与快照 ----------

    /// 状态迁移：校验合法性，发布事件和快照
    fn transition(&mut self, next: DownloadState) -> bool {
        let current = self.task.state;
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            warn!("非法状态迁移: {} -> {} ({})", current, next, self.task.id);
            return false;
        }

        self.task.set_state(next);
        info!("任务状态变更: {} {} -> {}", self.task.id, current, next);
        self.publish_snapshot();
        self.engine
            .publish(DownloadEvent::state_changed(&self.task.id, current, next));
        true
    }

    fn publish_snapshot(&mut self) {
        self.task.chunks = match (&self.store, self.task.state) {
            (_, DownloadState::Finished) => None,
            (Some(store), _) => Some(store.snapshot()),
            _ => None,
        };
        self.snapshot.send_replace(self.task.clone());
    }
}

/// 重建覆盖整个文件的单分片存储，保留重试记录和退避
fn restart_from_zero(size: u64, chunk: &Chunk, not_before: Option<Instant>) -> ChunkStore {
    let mut store = ChunkStore::new(size, size, chunk.url_index);
    if let Ok(lease) = store.claim(0, size, chunk.url_index) {
        if let Ok(Some(fresh)) = store.release(lease.id, not_before) {
            fresh.retries = chunk.retries;
        }
    }
    store
}

/// 只接受 http/https 链接
pub(crate) fn validate_url(url: &str) -> Result<(), ControlError> {
    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(ControlError::InvalidUrl(url.to_string())),
    }
}
