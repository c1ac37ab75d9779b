// 引擎对外错误类型

use crate::downloader::record::DownloadStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("任务不存在: {0}")]
    NotFound(String),

    #[error("任务 {id} 当前状态为 {status}，不允许此操作")]
    InvalidState { id: String, status: DownloadStatus },

    #[error("任务ID重复: {0}")]
    DuplicateId(String),

    #[error("无效的下载记录: {0}")]
    InvalidRecord(String),

    #[error("持久化失败: {0:#}")]
    Persistence(#[from] anyhow::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
