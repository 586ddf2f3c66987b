//! 测试用的 HTTP 镜像

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// 按 Range 请求头返回文件片段的镜像
pub(crate) struct RangeFile {
    data: Arc<Vec<u8>>,
    ranges: bool,
    hits: Arc<AtomicUsize>,
}

impl RangeFile {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            ranges: true,
            hits: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 忽略 Range，总是返回 200 + 完整内容
    pub(crate) fn without_ranges(data: Vec<u8>) -> Self {
        Self {
            ranges: false,
            ..Self::new(data)
        }
    }

    pub(crate) fn hit_counter(&self) -> Arc<AtomicUsize> {
        self.hits.clone()
    }
}

fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some((start, end))
}

impl Respond for RangeFile {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let len = self.data.len() as u64;
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);

        match range {
            Some((start, end)) if self.ranges => {
                if start >= len {
                    return ResponseTemplate::new(416)
                        .insert_header("Content-Range", format!("bytes */{}", len).as_str());
                }
                let end = end.unwrap_or(len - 1).min(len - 1);
                let body = self.data[start as usize..=end as usize].to_vec();
                ResponseTemplate::new(206)
                    .insert_header(
                        "Content-Range",
                        format!("bytes {}-{}/{}", start, end, len).as_str(),
                    )
                    .set_body_bytes(body)
            }
            _ => ResponseTemplate::new(200).set_body_bytes(self.data.as_ref().clone()),
        }
    }
}

/// 启动一个支持 Range 的镜像，所有 GET 路径都返回 `data`
pub(crate) async fn range_server(data: &[u8]) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(RangeFile::new(data.to_vec()))
        .mount(&server)
        .await;
    server
}

/// 返回 200、不带 Content-Length、写完即关闭连接的服务器
pub(crate) async fn unsized_server(data: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let data = Arc::new(data);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let data = data.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n";
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&data).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}/stream.bin", addr)
}

/// 返回 200 + Content-Length: `total`，先发 `burst` 字节，之后每隔 `interval` 发 1 字节
pub(crate) async fn trickle_server(total: usize, burst: usize, interval: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n\r\n",
                    total
                );
                if socket.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                if socket.write_all(&vec![7u8; burst]).await.is_err() {
                    return;
                }
                for _ in burst..total {
                    tokio::time::sleep(interval).await;
                    if socket.write_all(&[7u8]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    format!("http://{}/slow.bin", addr)
}
