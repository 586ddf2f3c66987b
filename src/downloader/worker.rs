//! 传输 worker
//!
//! 一个 worker = 对一个链接、一个分片发起的一次 HTTP 请求。
//! worker 只负责把字节写到文件的正确位置并汇报已落盘的进度，
//! 是否重试、换链接由协调器和调度器决定。

use crate::downloader::{BandwidthLimiter, DownloadError, Lease};
use futures::StreamExt;
use regex::Regex;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 每落盘 256KB 汇报一次进度
pub const PROGRESS_FLUSH_THRESHOLD: u64 = 256 * 1024;

/// worker ID（单个任务内唯一）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u64);

/// 首个响应头中的信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInfo {
    pub status: u16,
    /// 文件总大小（来自 Content-Range，其次 Content-Length）
    pub total_size: Option<u64>,
    /// 服务器返回了 206 + Content-Range
    pub range_supported: bool,
    /// Content-Disposition 中的文件名
    pub file_name: Option<String>,
    /// 跟随重定向后的最终地址
    pub final_url: String,
}

/// 协调器对探测请求的答复
#[derive(Debug, Clone)]
pub struct ProbePlan {
    /// 写入的文件（已创建）
    pub path: PathBuf,
    /// 需要读取的字节数，None 表示读到连接结束
    pub limit: Option<u64>,
}

/// worker 发往协调器的消息
#[derive(Debug)]
pub enum WorkerEvent {
    /// 探测请求收到了响应头，等待协调器决定读取多少
    Headers {
        worker: WorkerId,
        info: ResponseInfo,
        reply: oneshot::Sender<ProbePlan>,
    },
    /// 又有 `bytes` 字节已写入并刷新
    Progress { worker: WorkerId, bytes: u64 },
    Finished { worker: WorkerId },
    Failed { worker: WorkerId, error: DownloadError },
}

/// 传输 worker
#[derive(Clone)]
pub struct TransferWorker {
    pub id: WorkerId,
    pub client: Client,
    pub url: String,
    pub referer: Option<String>,
    pub stall_timeout: Duration,
    pub limiter: Arc<BandwidthLimiter>,
    pub cancel: CancellationToken,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
}

impl TransferWorker {
    /// 探测模式：`Range: bytes=0-`，先汇报响应头，再按答复读取
    pub fn spawn_probe(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let result = self.run_probe().await;
            self.report(result);
        })
    }

    /// 分片模式：下载租约对应的范围
    pub fn spawn_fetch(self, lease: Lease, path: PathBuf) -> JoinHandle<()> {
        tokio::spawn(async move {
            let result = self.run_fetch(&lease, path).await;
            self.report(result);
        })
    }

    fn report(&self, result: Result<(), DownloadError>) {
        let event = match result {
            Ok(()) => WorkerEvent::Finished { worker: self.id },
            // 被取消的 worker 不再汇报任何消息
            Err(DownloadError::Cancelled) => return,
            Err(error) => {
                debug!("worker {:?} 失败: url={}, 错误={}", self.id, self.url, error);
                WorkerEvent::Failed {
                    worker: self.id,
                    error,
                }
            }
        };
        let _ = self.events.send(event);
    }

    async fn run_probe(&self) -> Result<(), DownloadError> {
        let resp = self.send("bytes=0-".to_string()).await?;
        let info = inspect_response(&resp)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.events
            .send(WorkerEvent::Headers {
                worker: self.id,
                info,
                reply: reply_tx,
            })
            .map_err(|_| DownloadError::Cancelled)?;

        let plan = tokio::select! {
            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            plan = reply_rx => plan.map_err(|_| DownloadError::Cancelled)?,
        };

        self.stream_to_file(resp, plan.path, 0, plan.limit).await
    }

    async fn run_fetch(&self, lease: &Lease, path: PathBuf) -> Result<(), DownloadError> {
        debug!(
            "worker {:?} 下载分片: bytes={}-{}, url={}",
            self.id,
            lease.offset,
            lease.end() - 1,
            self.url
        );

        let resp = self.send(lease.range_header()).await?;
        inspect_response(&resp)?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {
                let start = resp
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range)
                    .map(|(start, _)| start);
                if start.is_some_and(|s| s != lease.offset) {
                    return Err(DownloadError::RangeIgnored);
                }
            }
            // 200 只在 offset 为 0 时可以接受（读满租约长度后断开）
            StatusCode::OK if lease.offset == 0 => {}
            StatusCode::OK => return Err(DownloadError::RangeIgnored),
            status => return Err(DownloadError::HttpStatus(status.as_u16())),
        }

        self.stream_to_file(resp, path, lease.offset, Some(lease.length))
            .await
    }

    async fn send(&self, range: String) -> Result<Response, DownloadError> {
        let mut request = self.client.get(&self.url).header("Range", range);
        if let Some(referer) = &self.referer {
            request = request.header("Referer", referer);
        }

        let resp = tokio::select! {
            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            resp = tokio::time::timeout(self.stall_timeout, request.send()) => {
                resp.map_err(|_| DownloadError::Stalled(self.stall_timeout.as_secs()))??
            }
        };

        let status = resp.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus(status.as_u16()));
        }
        Ok(resp)
    }

    /// 把响应体写到 `path` 的 `offset` 处，最多 `limit` 字节
    async fn stream_to_file(
        &self,
        resp: Response,
        path: PathBuf,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<(), DownloadError> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| DownloadError::Disk(format!("打开输出文件失败: {}", e)))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| DownloadError::Disk(format!("文件定位失败: {}", e)))?;

        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        let mut pending = 0u64;

        loop {
            if limit.is_some_and(|limit| written >= limit) {
                break;
            }

            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                next = tokio::time::timeout(self.stall_timeout, stream.next()) => next,
            };
            let bytes = match next {
                Err(_) => return Err(DownloadError::Stalled(self.stall_timeout.as_secs())),
                Ok(None) => break,
                Ok(Some(result)) => result.map_err(|e| DownloadError::Network(e.to_string()))?,
            };

            let mut data = &bytes[..];
            if let Some(limit) = limit {
                let room = (limit - written).min(data.len() as u64) as usize;
                data = &data[..room];
            }
            if data.is_empty() {
                continue;
            }

            if !self.limiter.acquire(data.len() as u64, &self.cancel).await {
                return Err(DownloadError::Cancelled);
            }

            file.write_all(data)
                .await
                .map_err(|e| DownloadError::Disk(format!("写入文件失败: {}", e)))?;
            written += data.len() as u64;
            pending += data.len() as u64;

            if pending >= PROGRESS_FLUSH_THRESHOLD {
                self.flush_progress(&mut file, &mut pending).await?;
            }
        }

        self.flush_progress(&mut file, &mut pending).await?;

        if let Some(limit) = limit {
            if written < limit {
                warn!(
                    "worker {:?} 连接提前关闭: 期望 {} bytes, 实际 {} bytes",
                    self.id, limit, written
                );
                return Err(DownloadError::Network(format!(
                    "连接提前关闭: 期望 {} bytes, 实际 {} bytes",
                    limit, written
                )));
            }
        }

        Ok(())
    }

    async fn flush_progress(
        &self,
        file: &mut tokio::fs::File,
        pending: &mut u64,
    ) -> Result<(), DownloadError> {
        if *pending == 0 {
            return Ok(());
        }
        file.flush()
            .await
            .map_err(|e| DownloadError::Disk(format!("刷新文件缓冲失败: {}", e)))?;
        if self.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let _ = self.events.send(WorkerEvent::Progress {
            worker: self.id,
            bytes: *pending,
        });
        *pending = 0;
        Ok(())
    }
}

/// 检查响应：网页视为跳转，其余提取文件信息
fn inspect_response(resp: &Response) -> Result<ResponseInfo, DownloadError> {
    let headers = resp.headers();
    let final_url = resp.url().to_string();

    let is_html = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().to_ascii_lowercase().starts_with("text/html"));
    if is_html {
        return Err(DownloadError::RedirectedAway(final_url));
    }

    let content_range = headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range);
    let content_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    let status = resp.status();
    let range_supported = status == StatusCode::PARTIAL_CONTENT && content_range.is_some();
    let total_size = match content_range {
        Some((_, Some(total))) if range_supported => Some(total),
        _ if status == StatusCode::OK => content_length,
        _ => None,
    };

    let file_name = headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_disposition);

    Ok(ResponseInfo {
        status: status.as_u16(),
        total_size,
        range_supported,
        file_name,
        final_url,
    })
}

/// 解析 `Content-Range: bytes <start>-<end>/<total>`，total 为 `*` 时返回 None
pub fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, total))
}

static EXTENDED_FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)filename\*\s*=\s*(?:[\w-]+)?'[^']*'([^;]+)"#).expect("valid regex")
});

static PLAIN_FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)filename\s*=\s*(?:"([^"]*)"|([^;]+))"#).expect("valid regex")
});

/// 从 Content-Disposition 中提取文件名（优先 RFC 5987 的 filename*）
pub fn parse_content_disposition(value: &str) -> Option<String> {
    if let Some(caps) = EXTENDED_FILENAME.captures(value) {
        if let Ok(decoded) = urlencoding::decode(caps[1].trim()) {
            return sanitize_file_name(&decoded);
        }
    }

    let caps = PLAIN_FILENAME.captures(value)?;
    let name = caps.get(1).or_else(|| caps.get(2))?.as_str().trim();
    sanitize_file_name(name)
}

/// 去掉路径部分和非法字符，空名返回 None
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}
