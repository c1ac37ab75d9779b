//! 分片下载
//!
//! 一个 `PartWorker::run` 调用负责把 `[start, end]` 区间写入目标文件的对应偏移。
//! 每次写盘完成后才回调进度，所以上报的字节数永远不会超过磁盘上真实存在的数据。

use super::http::RequestHeaders;
use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::time::Duration;
use tokio::{
    fs::OpenOptions,
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 分片失败分类
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartFailure {
    /// 可重试：超时、连接重置、5xx、429、提前断开
    Transient(String),
    /// 不可重试的 HTTP 状态
    Permanent { status: u16 },
    /// 服务器对非零偏移返回了 200
    RangeNotHonored,
    /// 本地文件读写失败
    Storage(String),
}

impl PartFailure {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PartFailure::Transient(_))
    }

    pub fn message(&self) -> String {
        match self {
            PartFailure::Transient(msg) => msg.clone(),
            PartFailure::Permanent { status } => format!("HTTP {}", status),
            PartFailure::RangeNotHonored => "服务器忽略了 Range 请求".to_string(),
            PartFailure::Storage(msg) => msg.clone(),
        }
    }
}

/// 分片下载结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartOutcome {
    /// 区间全部写完（大小未知时为读到流结尾）
    Completed { bytes: u64 },
    Failed(PartFailure),
    /// 被取消，已写入的数据保留在磁盘上
    Cancelled,
}

/// 单次分片请求参数
#[derive(Debug, Clone)]
pub struct PartRequest<'a> {
    pub index: usize,
    pub url: &'a str,
    /// 本次请求的起始偏移（含已下载部分）
    pub start: u64,
    /// 闭区间结尾，None 表示读到结尾
    pub end: Option<u64>,
    pub headers: &'a RequestHeaders,
    pub buffer_size: usize,
    pub read_timeout: Duration,
}

fn classify_status(status: StatusCode) -> PartFailure {
    let code = status.as_u16();
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        PartFailure::Transient(format!("HTTP {}", code))
    } else {
        PartFailure::Permanent { status: code }
    }
}

fn classify_request_error(e: &reqwest::Error) -> PartFailure {
    if let Some(status) = e.status() {
        return classify_status(status);
    }
    PartFailure::Transient(e.to_string())
}

pub struct PartWorker {
    client: Client,
}

impl PartWorker {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// 下载分片
    ///
    /// `on_bytes` 在每次写盘后调用，参数为新写入的字节数，返回值为限速休眠时长。
    pub async fn run<F>(
        &self,
        req: PartRequest<'_>,
        destination: &Path,
        cancel: &CancellationToken,
        mut on_bytes: F,
    ) -> PartOutcome
    where
        F: FnMut(u64) -> Duration + Send,
    {
        if let Some(end) = req.end {
            if req.start > end {
                return PartOutcome::Completed { bytes: 0 };
            }
        }
        if cancel.is_cancelled() {
            return PartOutcome::Cancelled;
        }

        let expected = req.end.map(|end| end + 1 - req.start);
        let ranged = req.start > 0 || req.end.is_some();

        debug!(
            "分片 #{} 开始请求: bytes={}-{}",
            req.index,
            req.start,
            req.end.map(|e| e.to_string()).unwrap_or_default()
        );

        // 1. 构建 Range 请求
        let mut request = req.headers.apply(self.client.get(req.url));
        if ranged {
            let range = match req.end {
                Some(end) => format!("bytes={}-{}", req.start, end),
                None => format!("bytes={}-", req.start),
            };
            request = request.header(RANGE, range);
        }

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PartOutcome::Cancelled,
            resp = tokio::time::timeout(req.read_timeout, request.send()) => match resp {
                Err(_) => return PartOutcome::Failed(PartFailure::Transient("等待响应超时".to_string())),
                Ok(Err(e)) => return PartOutcome::Failed(classify_request_error(&e)),
                Ok(Ok(resp)) => resp,
            },
        };

        // 2. 检查响应状态
        let status = resp.status();
        if status == StatusCode::OK {
            // 忽略 Range 的 200 只有在请求本就从 0 开始且长度吻合时可用
            let whole_body_ok = req.start == 0
                && match expected {
                    None => true,
                    Some(len) => resp.content_length().map_or(true, |cl| cl == len),
                };
            if ranged && !whole_body_ok {
                return PartOutcome::Failed(PartFailure::RangeNotHonored);
            }
        } else if status != StatusCode::PARTIAL_CONTENT {
            return PartOutcome::Failed(classify_status(status));
        }

        // 3. 打开文件并定位（不截断，其他分片在写同一个文件）
        let mut file = match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(destination)
            .await
        {
            Ok(file) => file,
            Err(e) => return PartOutcome::Failed(PartFailure::Storage(format!("打开输出文件失败: {}", e))),
        };
        if let Err(e) = file.seek(std::io::SeekFrom::Start(req.start)).await {
            return PartOutcome::Failed(PartFailure::Storage(format!("文件定位失败: {}", e)));
        }

        // 4. 流式读取，攒满缓冲区后写盘并回调
        let mut stream = resp.bytes_stream();
        let mut buffer: Vec<u8> = Vec::with_capacity(req.buffer_size);
        let mut written = 0u64;

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break PartOutcome::Cancelled,
                next = tokio::time::timeout(req.read_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => break PartOutcome::Failed(PartFailure::Transient("读取数据超时".to_string())),
                Ok(None) => break PartOutcome::Completed { bytes: 0 },
                Ok(Some(Err(e))) => {
                    break PartOutcome::Failed(PartFailure::Transient(format!("读取数据流失败: {}", e)))
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            // 服务器多发的数据直接丢弃
            let room = expected.map_or(u64::MAX, |len| len - written - buffer.len() as u64);
            let take = (chunk.len() as u64).min(room) as usize;
            buffer.extend_from_slice(&chunk[..take]);

            if buffer.len() >= req.buffer_size {
                match flush(&mut file, &mut buffer, &mut written, &mut on_bytes).await {
                    Ok(sleep) if !sleep.is_zero() => {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break PartOutcome::Cancelled,
                            _ = tokio::time::sleep(sleep) => {}
                        }
                    }
                    Ok(_) => {}
                    Err(failure) => break PartOutcome::Failed(failure),
                }
            }

            if expected.is_some_and(|len| written + buffer.len() as u64 >= len) {
                break PartOutcome::Completed { bytes: 0 };
            }
        };

        // 5. 无论结果如何，已收到的数据都写盘，保证进度不丢
        if let Err(failure) = flush(&mut file, &mut buffer, &mut written, &mut on_bytes).await {
            return PartOutcome::Failed(failure);
        }
        if let Err(e) = file.flush().await {
            return PartOutcome::Failed(PartFailure::Storage(format!("刷新文件缓冲失败: {}", e)));
        }

        match outcome {
            PartOutcome::Completed { .. } => {
                if let Some(len) = expected {
                    if written < len {
                        return PartOutcome::Failed(PartFailure::Transient(format!(
                            "连接提前关闭: {}/{} 字节",
                            written, len
                        )));
                    }
                }
                debug!("分片 #{} 下载完成，本次写入 {} 字节", req.index, written);
                PartOutcome::Completed { bytes: written }
            }
            other => {
                debug!("分片 #{} 结束: {:?}，本次写入 {} 字节", req.index, other, written);
                other
            }
        }
    }
}

async fn flush<F>(
    file: &mut tokio::fs::File,
    buffer: &mut Vec<u8>,
    written: &mut u64,
    on_bytes: &mut F,
) -> Result<Duration, PartFailure>
where
    F: FnMut(u64) -> Duration + Send,
{
    if buffer.is_empty() {
        return Ok(Duration::ZERO);
    }
    file.write_all(buffer)
        .await
        .map_err(|e| PartFailure::Storage(format!("写入文件失败: {}", e)))?;
    // tokio 的文件写入在后台完成，flush 之后数据才真正交给操作系统
    file.flush()
        .await
        .map_err(|e| PartFailure::Storage(format!("刷新文件缓冲失败: {}", e)))?;
    let n = buffer.len() as u64;
    buffer.clear();
    *written += n;
    Ok(on_bytes(n))
}
