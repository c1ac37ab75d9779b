// EveryDL
// 多线程分片下载引擎

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志系统
pub mod logging;

// 网络状态检测
pub mod network;

// 下载记录持久化
pub mod persistence;

// 下载引擎模块
pub mod downloader;

// Web服务器模块
pub mod server;

// 导出常用类型
pub use config::{AppConfig, DownloadSettings};
pub use downloader::{DownloadEngine, DownloadRecord, DownloadStatus};
pub use error::{EngineError, EngineResult};
pub use server::AppState;
