use everydl::{
    config::LogConfig,
    logging,
    persistence::JsonRecordStore,
    server::build_router,
    AppConfig, AppState, DownloadEngine,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const CONFIG_PATH: &str = "config/app.toml";

/// 加载日志配置
///
/// 尝试从配置文件加载，失败时返回默认配置
async fn load_log_config() -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(CONFIG_PATH).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }

    LogConfig::default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 🔥 先尝试加载日志配置，失败时使用默认配置
    let log_config = load_log_config().await;

    // 🔥 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&log_config);

    info!("EveryDL v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(CONFIG_PATH).await;
    let addr = format!("{}:{}", config.server.host, config.server.port);

    // 创建下载引擎并恢复历史记录
    let store = Arc::new(JsonRecordStore::new(config.persistence.records_dir.clone()));
    let engine = DownloadEngine::builder(config.download.settings.clone())
        .store(store)
        .snapshot_interval(Duration::from_millis(
            config.persistence.snapshot_interval_ms,
        ))
        .build();
    let restored = engine.initialize().await?;
    info!("下载引擎初始化完成，恢复 {} 条记录", restored);

    let cors_origins = config.server.cors_origins.clone();
    let app_state = AppState::new(engine, config, CONFIG_PATH);
    let app = build_router(app_state.clone(), &cors_origins);

    // 启动服务器
    info!("服务器启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api/v1", addr);
    info!("WebSocket: ws://{}/api/v1/ws", addr);
    info!("健康检查: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    // 🔥 优雅关闭：暂停下载并落盘
    info!("正在暂停下载任务并保存记录...");
    app_state.shutdown().await;
    info!("应用已安全退出");

    Ok(())
}
