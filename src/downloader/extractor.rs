// 外部媒体提取工具接口（yt-dlp 等）

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 提取工具错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractorError {
    /// 该地址无法解析为直链，需要由工具自己下载
    #[error("不支持直接解析该地址")]
    Unsupported,
    /// 需要登录
    #[error("需要登录: {0}")]
    LoginRequired(String),
    #[error("提取失败: {0}")]
    Failed(String),
    #[error("已取消")]
    Cancelled,
}

/// 提取参数
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    pub format_id: Option<String>,
    pub cookies: Option<String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub proxy: Option<String>,
}

#[async_trait]
pub trait MediaExtractor: Send + Sync {
    /// 把页面地址解析为可直接下载的文件地址
    async fn resolve_direct_url(
        &self,
        source_url: &str,
        options: &ExtractOptions,
    ) -> Result<String, ExtractorError>;

    /// 由工具自行下载到 `destination`，每行输出发送到 `lines`
    async fn run(
        &self,
        source_url: &str,
        options: &ExtractOptions,
        destination: &Path,
        lines: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<(), ExtractorError>;
}
