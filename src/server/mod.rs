// Web服务器模块

pub mod error;
pub mod handlers;
pub mod state;
pub mod websocket;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::{
    http::HeaderValue,
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

/// 健康检查响应结构
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "everydl".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("忽略无效的 CORS 源: {}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(parsed)
}

/// 构建完整路由
pub fn build_router(app_state: AppState, cors_origins: &[String]) -> Router {
    // 配置中间件层
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins));

    let api_routes = Router::new()
        // 下载API
        .route(
            "/downloads",
            get(handlers::get_all_downloads).post(handlers::create_download),
        )
        .route("/downloads/pause-all", post(handlers::pause_all_downloads))
        .route(
            "/downloads/:id",
            get(handlers::get_download).delete(handlers::delete_download),
        )
        .route("/downloads/:id/pause", post(handlers::pause_download))
        .route("/downloads/:id/resume", post(handlers::resume_download))
        // 配置API
        .route("/config", get(handlers::get_config))
        .route("/config/download", put(handlers::update_download_config))
        // WebSocket
        .route("/ws", get(websocket::handle_websocket))
        .with_state(app_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(middleware)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::downloader::test_support::{test_body, TestServer};
    use crate::downloader::{DownloadEngine, DownloadRecord, DownloadStatus};
    use handlers::{ApiResponse, DownloadListResponse};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn spawn_app(config: AppConfig, config_path: String) -> (String, AppState) {
        let engine = DownloadEngine::new(config.download.settings.clone());
        let state = AppState::new(engine, config, config_path);
        let app = build_router(state.clone(), &["*".to_string()]);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{}", addr), state)
    }

    fn test_config(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.download.download_dir = dir.path().join("downloads");
        config.download.settings.progress_interval_ms = 50;
        config.download.settings.min_free_space_margin = 0;
        config
    }

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let (base, _) = spawn_app(test_config(&dir), String::new()).await;
        let body: serde_json::Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_download_lifecycle_over_http() {
        let server = TestServer::start(32 * 1024).await;
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let download_dir = config.download.download_dir.clone();
        let (base, state) = spawn_app(config, String::new()).await;
        let client = reqwest::Client::new();

        let created: ApiResponse<DownloadRecord> = client
            .post(format!("{}/api/v1/downloads", base))
            .json(&serde_json::json!({ "url": server.url(), "file_name": "api.bin" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(created.code, 0);
        let record = created.data.unwrap();
        assert_eq!(record.file_directory, download_dir);

        for _ in 0..300 {
            if state
                .engine
                .get_record(&record.id)
                .is_some_and(|r| r.status == DownloadStatus::Complete)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let list: ApiResponse<DownloadListResponse> = client
            .get(format!("{}/api/v1/downloads", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let list = list.data.unwrap();
        assert!(list.active.is_empty());
        assert_eq!(list.finished[0].id, record.id);
        assert_eq!(
            std::fs::read(download_dir.join("api.bin")).unwrap(),
            test_body(32 * 1024)
        );

        let resp = client
            .post(format!("{}/api/v1/downloads/{}/resume", base, record.id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);

        let resp = client
            .delete(format!("{}/api/v1/downloads/{}?delete_file=true", base, record.id))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        assert!(!download_dir.join("api.bin").exists());

        let resp = client
            .get(format!("{}/api/v1/downloads/{}", base, record.id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_download_request() {
        let dir = TempDir::new().unwrap();
        let (base, _) = spawn_app(test_config(&dir), String::new()).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/api/v1/downloads", base))
            .json(&serde_json::json!({ "url": "::not a url::" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: ApiResponse<()> = resp.json().await.unwrap();
        assert_eq!(body.code, 400);
    }

    #[tokio::test]
    async fn test_update_download_config() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config/app.toml");
        let (base, state) = spawn_app(
            test_config(&dir),
            config_path.to_string_lossy().into_owned(),
        )
        .await;

        let mut settings = state.engine.default_settings();
        settings.max_parts = 3;
        let resp = reqwest::Client::new()
            .put(format!("{}/api/v1/config/download", base))
            .json(&serde_json::json!({ "settings": settings }))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        assert_eq!(state.engine.default_settings().max_parts, 3);

        let saved = AppConfig::load_from_file(&config_path.to_string_lossy())
            .await
            .unwrap();
        assert_eq!(saved.download.settings.max_parts, 3);

        settings.max_parts = 0;
        let resp = reqwest::Client::new()
            .put(format!("{}/api/v1/config/download", base))
            .json(&serde_json::json!({ "settings": settings }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        assert_eq!(state.engine.default_settings().max_parts, 3);
    }
}
