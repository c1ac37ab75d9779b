// 应用状态

use crate::config::AppConfig;
use crate::downloader::{BroadcastObserver, DownloadEngine, EngineEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// 事件广播通道容量
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 下载引擎
    pub engine: DownloadEngine,
    /// 应用配置
    pub config: Arc<RwLock<AppConfig>>,
    /// 配置文件路径
    pub config_path: Arc<String>,
    /// 引擎事件（WebSocket 订阅）
    pub events: broadcast::Sender<EngineEvent>,
}

impl AppState {
    /// 创建应用状态，并把引擎事件接入广播通道
    pub fn new(engine: DownloadEngine, config: AppConfig, config_path: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        engine.register_observer(Arc::new(BroadcastObserver::new(events.clone())));

        Self {
            engine,
            config: Arc::new(RwLock::new(config)),
            config_path: Arc::new(config_path.into()),
            events,
        }
    }

    /// 优雅关闭：暂停全部任务并等待会话结束
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}
