// HTTP 客户端构建与公共请求头

use crate::config::DownloadSettings;
use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder};
use std::time::Duration;

/// 请求附带的头信息（Cookie、Referer、User-Agent）
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    pub cookie: Option<String>,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestHeaders {
    pub fn apply(&self, mut request: RequestBuilder) -> RequestBuilder {
        if let Some(cookie) = self.cookie.as_deref().filter(|c| !c.is_empty()) {
            request = request.header(reqwest::header::COOKIE, cookie);
        }
        if let Some(referrer) = self.referrer.as_deref().filter(|r| !r.is_empty()) {
            request = request.header(reqwest::header::REFERER, referrer);
        }
        if let Some(ua) = self.user_agent.as_deref().filter(|u| !u.is_empty()) {
            request = request.header(reqwest::header::USER_AGENT, ua);
        }
        request
    }
}

/// 创建下载用的 HTTP 客户端
///
/// 不设置整体超时（大分片可能持续很久），读取超时由分片下载逐次控制。
pub fn build_client(settings: &DownloadSettings) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(settings.user_agent.as_str())
        .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
        .pool_max_idle_per_host(settings.max_parts.max(1) * 2)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .tcp_nodelay(true)
        .redirect(reqwest::redirect::Policy::limited(10));

    if let Some(proxy) = settings.proxy.as_deref().filter(|p| !p.is_empty()) {
        let proxy = reqwest::Proxy::all(proxy).with_context(|| format!("代理地址无效: {}", proxy))?;
        builder = builder.proxy(proxy);
    }

    builder.build().context("创建 HTTP 客户端失败")
}

/// 解析 `Content-Range: bytes 0-0/12345` 中的总大小
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let total = value.trim().rsplit('/').next()?;
    if total == "*" {
        return None;
    }
    total.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(parse_content_range_total("bytes 100-199/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_build_client_with_proxy() {
        let mut settings = DownloadSettings::default();
        settings.proxy = Some("socks5://127.0.0.1:1080".to_string());
        assert!(build_client(&settings).is_ok());

        settings.proxy = Some("ftp://127.0.0.1:21".to_string());
        assert!(build_client(&settings).is_err());
    }
}
