//! 断点续传探测
//!
//! 先发 HEAD，信息不全时再发 `Range: bytes=0-0` 的 GET 确认。
//! 探测从不报错：网络失败时按"不支持续传、大小未知"处理。

use super::http::{parse_content_range_total, RequestHeaders};
use super::naming::file_name_from_disposition;
use reqwest::header::{
    HeaderMap, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, ETAG,
    LAST_MODIFIED, RANGE,
};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

/// 探测结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    /// 服务器是否支持 Range
    pub supports_range: bool,
    /// 内容长度（0 或缺失视为未知）
    pub content_length: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Content-Disposition 给出的文件名
    pub file_name: Option<String>,
    /// 最近一次响应的状态码
    pub status: Option<u16>,
}

impl ProbeResult {
    /// 是否可以多线程分片下载
    pub fn multi_thread_supported(&self) -> bool {
        self.supports_range && self.content_length.is_some()
    }

    /// 与已记录的校验值比较，判断服务器上的文件是否变化
    pub fn validator_changed(&self, etag: Option<&str>, last_modified: Option<&str>) -> bool {
        let differs = |old: Option<&str>, new: Option<&str>| matches!((old, new), (Some(a), Some(b)) if a != b);
        differs(etag, self.etag.as_deref()) || differs(last_modified, self.last_modified.as_deref())
    }
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn header_length(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, CONTENT_LENGTH)
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|len| *len > 0)
}

pub struct ResumeProbe {
    client: Client,
    timeout: Duration,
}

impl ResumeProbe {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// 探测服务器能力
    pub async fn probe(&self, url: &str, headers: &RequestHeaders) -> ProbeResult {
        let mut result = ProbeResult::default();

        match headers
            .apply(self.client.head(url))
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(resp) => {
                result.status = Some(resp.status().as_u16());
                if resp.status().is_success() {
                    let h = resp.headers();
                    result.content_length = header_length(h);
                    result.supports_range = header_str(h, ACCEPT_RANGES)
                        .map(|v| v.to_ascii_lowercase().contains("bytes"))
                        .unwrap_or(false);
                    result.etag = header_str(h, ETAG);
                    result.last_modified = header_str(h, LAST_MODIFIED);
                    result.file_name = header_str(h, CONTENT_DISPOSITION)
                        .as_deref()
                        .and_then(file_name_from_disposition);

                    if result.supports_range && result.content_length.is_some() {
                        debug!("HEAD 探测完成: {} -> {:?}", url, result);
                        return result;
                    }
                }
            }
            Err(e) => {
                debug!("HEAD 请求失败，改用 Range GET 探测: {}", e);
            }
        }

        match headers
            .apply(self.client.get(url))
            .header(RANGE, "bytes=0-0")
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(resp) => {
                let status = resp.status();
                result.status = Some(status.as_u16());
                let h = resp.headers();
                if result.etag.is_none() {
                    result.etag = header_str(h, ETAG);
                }
                if result.last_modified.is_none() {
                    result.last_modified = header_str(h, LAST_MODIFIED);
                }
                if result.file_name.is_none() {
                    result.file_name = header_str(h, CONTENT_DISPOSITION)
                        .as_deref()
                        .and_then(file_name_from_disposition);
                }

                if status == StatusCode::PARTIAL_CONTENT {
                    result.supports_range = true;
                    if let Some(total) = header_str(h, CONTENT_RANGE)
                        .as_deref()
                        .and_then(parse_content_range_total)
                        .filter(|len| *len > 0)
                    {
                        result.content_length = Some(total);
                    }
                } else if status.is_success() {
                    // 200：服务器忽略了 Range
                    result.supports_range = false;
                    if let Some(len) = header_length(h) {
                        result.content_length = Some(len);
                    }
                } else {
                    result.supports_range = false;
                }
            }
            Err(e) => {
                warn!("探测失败，按不支持续传处理: {} ({})", url, e);
                result.supports_range = false;
            }
        }

        debug!("探测完成: {} -> {:?}", url, result);
        result
    }
}
