// 配置管理 API

use crate::config::{AppConfig, DownloadSettings};
use crate::server::error::{ApiError, ApiResult};
use crate::server::AppState;
use axum::{extract::State, response::Json};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::info;

use super::ApiResponse;

/// GET /api/v1/config
/// 获取当前配置
pub async fn get_config(
    State(app_state): State<AppState>,
) -> ApiResult<Json<ApiResponse<AppConfig>>> {
    let config = app_state.config.read().await.clone();
    Ok(Json(ApiResponse::success(config)))
}

/// 下载配置更新请求
#[derive(Debug, Deserialize)]
pub struct UpdateDownloadConfigRequest {
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    pub settings: DownloadSettings,
}

/// PUT /api/v1/config/download
/// 更新下载配置（只影响之后新建的任务）
pub async fn update_download_config(
    State(app_state): State<AppState>,
    Json(req): Json<UpdateDownloadConfigRequest>,
) -> ApiResult<Json<ApiResponse<AppConfig>>> {
    req.settings
        .validate()
        .map_err(|e| ApiError::BadRequest(format!("{:#}", e)))?;

    let mut config = app_state.config.read().await.clone();
    config.download.settings = req.settings.clone();
    if let Some(dir) = req.download_dir {
        config.download.download_dir = dir;
    }

    config
        .save_to_file(app_state.config_path.as_str())
        .await
        .map_err(ApiError::Internal)?;
    app_state.engine.update_default_settings(req.settings)?;
    *app_state.config.write().await = config.clone();

    info!("✓ 下载配置已更新: 下载目录={:?}", config.download.download_dir);
    Ok(Json(ApiResponse::success(config)))
}
