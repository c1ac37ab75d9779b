use crate::downloader::{DownloadRecord, VideoFormat, VideoInfo};
use crate::server::error::{ApiError, ApiResult};
use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

use super::ApiResponse;

/// 创建下载任务请求
#[derive(Debug, Deserialize)]
pub struct CreateDownloadRequest {
    /// 下载地址（流媒体任务为页面地址）
    pub url: String,
    /// 文件名，缺省时从地址推断
    #[serde(default)]
    pub file_name: Option<String>,
    /// 保存目录，缺省时使用配置的下载目录
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub cookies: Option<String>,
    /// 期望的 SHA-256
    #[serde(default)]
    pub expected_checksum: Option<String>,
    /// 视频信息，存在时创建流媒体任务
    #[serde(default, alias = "stream")]
    pub video: Option<VideoInfo>,
    #[serde(default)]
    pub format: Option<VideoFormat>,
}

/// 任务列表响应
#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadListResponse {
    /// 引擎是否仍在恢复历史记录
    pub initializing: bool,
    pub active: Vec<DownloadRecord>,
    pub finished: Vec<DownloadRecord>,
}

/// POST /api/v1/downloads
/// 创建下载任务并立即开始
pub async fn create_download(
    State(app_state): State<AppState>,
    Json(req): Json<CreateDownloadRequest>,
) -> ApiResult<Json<ApiResponse<DownloadRecord>>> {
    let directory = match req.directory {
        Some(dir) => dir,
        None => app_state.config.read().await.download.download_dir.clone(),
    };

    let mut record = match req.video {
        Some(mut video) => {
            if video.source_url.is_empty() {
                video.source_url = req.url.clone();
            }
            let name = req
                .file_name
                .clone()
                .or_else(|| video.title.clone())
                .ok_or_else(|| ApiError::BadRequest("流媒体任务需要文件名或标题".to_string()))?;
            app_state
                .engine
                .new_stream_record(video, req.format, &name, directory)
        }
        None => app_state
            .engine
            .new_record(&req.url, req.file_name.as_deref(), directory),
    };
    record.site_referrer = req.referrer;
    record.site_cookie_string = req.cookies;
    record.expected_checksum = req.expected_checksum;

    let added = app_state.engine.add_download(record).await?;
    info!("创建下载任务成功: {} -> {}", added.id, added.file_name);
    Ok(Json(ApiResponse::success(added)))
}

/// GET /api/v1/downloads
/// 获取所有下载任务
pub async fn get_all_downloads(
    State(app_state): State<AppState>,
) -> ApiResult<Json<ApiResponse<DownloadListResponse>>> {
    Ok(Json(ApiResponse::success(DownloadListResponse {
        initializing: app_state.engine.is_initializing(),
        active: app_state.engine.active_download_data_models(),
        finished: app_state.engine.finished_download_data_models(),
    })))
}

/// GET /api/v1/downloads/:id
/// 获取指定下载任务
pub async fn get_download(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<DownloadRecord>>> {
    app_state
        .engine
        .get_record(&id)
        .map(|record| Json(ApiResponse::success(record)))
        .ok_or_else(|| ApiError::NotFound(format!("任务不存在: {}", id)))
}

/// POST /api/v1/downloads/:id/pause
/// 暂停下载任务
pub async fn pause_download(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<String>>> {
    app_state.engine.pause_download(&id)?;
    info!("暂停下载任务成功: {}", id);
    Ok(Json(ApiResponse::success("Task paused".to_string())))
}

/// POST /api/v1/downloads/:id/resume
/// 恢复下载任务
pub async fn resume_download(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<String>>> {
    app_state.engine.resume_download(&id).await?;
    info!("恢复下载任务成功: {}", id);
    Ok(Json(ApiResponse::success("Task resumed".to_string())))
}

/// POST /api/v1/downloads/pause-all
/// 暂停全部任务，返回发出暂停请求的数量
pub async fn pause_all_downloads(
    State(app_state): State<AppState>,
) -> ApiResult<Json<ApiResponse<usize>>> {
    let count = app_state.engine.pause_all_downloads();
    Ok(Json(ApiResponse::success(count)))
}

/// DELETE /api/v1/downloads/:id
/// 删除下载任务
#[derive(Debug, Deserialize)]
pub struct DeleteDownloadQuery {
    /// 同时删除已下载的文件
    #[serde(default)]
    pub delete_file: bool,
}

pub async fn delete_download(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeleteDownloadQuery>,
) -> ApiResult<Json<ApiResponse<String>>> {
    if query.delete_file {
        app_state.engine.delete_download(&id).await?;
    } else {
        app_state.engine.clear_download(&id).await?;
    }
    info!("删除下载任务成功: {} (删除文件={})", id, query.delete_file);
    Ok(Json(ApiResponse::success("Task deleted".to_string())))
}
