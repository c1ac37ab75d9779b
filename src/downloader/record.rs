//! 下载记录
//!
//! 一条记录描述一个下载任务的全部可持久化状态：来源、目标文件、分片布局、
//! 每个分片已写入的字节数、状态机以及展示用的速度信息。

use crate::config::DownloadSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// 已创建，尚未开始
    Queued,
    /// 下载中
    Downloading,
    /// 已暂停
    Paused,
    /// 已完成
    Complete,
    /// 失败
    Failed,
    /// 已关闭（记录即将移除）
    Close,
}

impl DownloadStatus {
    /// 状态机允许的迁移
    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        match (self, next) {
            (Queued, Downloading) => true,
            (Downloading, Paused | Complete | Failed) => true,
            (Paused | Failed, Downloading) => true,
            (Complete, _) => false,
            (_, Close) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Complete => "complete",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Close => "close",
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownloadKind {
    /// 普通 HTTP 分片下载
    #[default]
    Http,
    /// 由外部提取工具驱动的流媒体任务
    Stream,
}

/// 失败原因
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureReason {
    /// 链接失效（403/404/410）
    UrlExpired { status: u16 },
    /// 其他不可重试的 HTTP 状态
    HttpStatus { status: u16 },
    /// 分片重试次数耗尽
    RetriesExhausted { part: usize, message: String },
    /// 存储空间不足
    InsufficientStorage { required: u64, available: u64 },
    /// 目标文件无法访问
    FileAccess { message: String },
    /// 校验和不一致
    ChecksumMismatch { expected: String, actual: String },
    /// 服务器忽略了 Range 请求
    RangeNotHonored,
    /// 服务器返回空内容
    EmptyBody,
    /// HTTP 客户端无法创建（代理配置等）
    ClientSetup { message: String },
    /// 外部提取工具失败
    Extractor { message: String, login_required: bool },
    /// 任务意外中断
    Interrupted,
}

impl FailureReason {
    /// 展示用的描述
    pub fn describe(&self) -> String {
        match self {
            FailureReason::UrlExpired { status } => format!("下载链接已失效 (HTTP {})", status),
            FailureReason::HttpStatus { status } => format!("服务器返回错误 (HTTP {})", status),
            FailureReason::RetriesExhausted { part, message } => {
                format!("分片 #{} 重试次数耗尽: {}", part, message)
            }
            FailureReason::InsufficientStorage {
                required,
                available,
            } => format!(
                "存储空间不足: 需要 {}, 可用 {}",
                format_size(*required),
                format_size(*available)
            ),
            FailureReason::FileAccess { message } => format!("无法访问文件: {}", message),
            FailureReason::ChecksumMismatch { expected, actual } => {
                format!("校验失败: 期望 {}, 实际 {}", expected, actual)
            }
            FailureReason::RangeNotHonored => "服务器不支持断点续传".to_string(),
            FailureReason::EmptyBody => "服务器返回空内容".to_string(),
            FailureReason::ClientSetup { message } => format!("网络客户端初始化失败: {}", message),
            FailureReason::Extractor { message, .. } => message.clone(),
            FailureReason::Interrupted => "任务意外中断".to_string(),
        }
    }
}

/// 分片字节区间（end 为闭区间，None 表示大小未知的开放区间）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl PartRange {
    /// 分片长度
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end + 1 - self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

/// 把 `[0, file_size)` 切成 `count` 个连续分片，最后一个分片吸收余数
pub fn plan_part_ranges(file_size: u64, count: usize) -> Vec<PartRange> {
    if file_size == 0 {
        return vec![PartRange { start: 0, end: None }];
    }

    let count = (count.max(1) as u64).min(file_size);
    let span = file_size / count;

    (0..count)
        .map(|i| {
            let start = i * span;
            let end = if i == count - 1 {
                file_size - 1
            } else {
                start + span - 1
            };
            PartRange {
                start,
                end: Some(end),
            }
        })
        .collect()
}

/// 视频信息（流媒体任务）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VideoInfo {
    /// 原始页面地址，缺省时取请求中的 url
    #[serde(default)]
    pub source_url: String,
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    /// 时长（秒）
    pub duration: Option<u64>,
}

/// 选定的视频格式
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VideoFormat {
    pub format_id: String,
    pub extension: Option<String>,
    pub resolution: Option<String>,
    pub filesize: Option<u64>,
}

/// 下载记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// 记录ID
    pub id: String,
    /// 任务类型
    #[serde(default)]
    pub kind: DownloadKind,

    /// 文件名（已处理重名）
    pub file_name: String,
    /// 保存目录
    pub file_directory: PathBuf,
    /// 下载地址
    pub file_url: String,
    /// 来源页面
    #[serde(default)]
    pub site_referrer: Option<String>,
    /// 请求携带的 Cookie
    #[serde(default)]
    pub site_cookie_string: Option<String>,

    /// 文件大小（字节，未知时为 0）
    pub file_size: u64,
    /// 文件大小是否未知
    pub is_unknown_file_size: bool,
    /// 已下载字节数（等于各分片之和）
    pub downloaded_byte: u64,
    /// 总进度 0-100
    pub progress_percentage: u8,

    /// 分片区间
    pub part_ranges: Vec<PartRange>,
    /// 各分片已写入的字节数
    pub parts_downloaded_byte: Vec<u64>,
    /// 各分片进度 0-100
    pub part_progress_percentage: Vec<u8>,

    /// 是否支持断点续传
    pub is_resume_supported: bool,
    /// 是否支持多线程分片
    pub is_multi_thread_supported: bool,
    /// 服务器 ETag
    #[serde(default)]
    pub etag: Option<String>,
    /// 服务器 Last-Modified
    #[serde(default)]
    pub last_modified: Option<String>,

    /// 当前状态
    pub status: DownloadStatus,
    /// 展示用的状态描述
    #[serde(default)]
    pub status_info: String,
    /// 失败原因
    #[serde(default)]
    pub failure: Option<FailureReason>,

    /// 创建时间（Unix 毫秒）
    pub created_at: i64,
    /// 首次开始时间
    #[serde(default)]
    pub start_time_date: Option<i64>,
    /// 最后修改时间
    pub last_modified_time_date: i64,
    /// 完成时间
    #[serde(default)]
    pub completed_at: Option<i64>,
    /// 累计下载耗时（毫秒，不含暂停）
    #[serde(default)]
    pub time_spent: u64,
    /// 预计剩余时间（秒）
    #[serde(default)]
    pub remaining_time: Option<u64>,

    /// 实时速度（字节/秒）
    #[serde(default)]
    pub realtime_speed: u64,
    /// 平均速度
    #[serde(default)]
    pub average_speed: u64,
    /// 最高速度
    #[serde(default)]
    pub max_speed: u64,

    /// 累计连接重试次数
    #[serde(default)]
    pub total_connection_retries: u32,
    #[serde(default)]
    pub is_file_url_expired: bool,
    #[serde(default)]
    pub is_failed_to_access_file: bool,
    #[serde(default)]
    pub is_insufficient_storage: bool,
    #[serde(default)]
    pub is_waiting_for_network: bool,

    /// 下载参数快照
    #[serde(default)]
    pub settings: DownloadSettings,

    /// 期望的 SHA-256（十六进制）
    #[serde(default)]
    pub expected_checksum: Option<String>,
    /// 实际计算出的 SHA-256
    #[serde(default)]
    pub checksum: Option<String>,

    /// 视频信息
    #[serde(default)]
    pub video_info: Option<VideoInfo>,
    /// 视频格式
    #[serde(default)]
    pub video_format: Option<VideoFormat>,
    /// 提取工具最近一行输出
    #[serde(default)]
    pub temp_ytdlp_status_info: Option<String>,
    #[serde(default)]
    pub is_ytdlp_having_problem: bool,
    #[serde(default)]
    pub ytdlp_problem_msg: Option<String>,
    #[serde(default)]
    pub is_ytdlp_login_required: bool,

    /// 本次下载会话的开始时刻（不持久化）
    #[serde(skip)]
    session_started: Option<Instant>,
}

/// 非法状态迁移
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: DownloadStatus,
    pub to: DownloadStatus,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "非法状态迁移: {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl DownloadRecord {
    /// 创建 HTTP 下载记录
    pub fn new(
        file_url: impl Into<String>,
        file_name: impl Into<String>,
        file_directory: impl Into<PathBuf>,
        settings: DownloadSettings,
    ) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: DownloadKind::Http,
            file_name: file_name.into(),
            file_directory: file_directory.into(),
            file_url: file_url.into(),
            site_referrer: None,
            site_cookie_string: None,
            file_size: 0,
            is_unknown_file_size: true,
            downloaded_byte: 0,
            progress_percentage: 0,
            part_ranges: vec![PartRange { start: 0, end: None }],
            parts_downloaded_byte: vec![0],
            part_progress_percentage: vec![0],
            is_resume_supported: false,
            is_multi_thread_supported: false,
            etag: None,
            last_modified: None,
            status: DownloadStatus::Queued,
            status_info: String::new(),
            failure: None,
            created_at: now,
            start_time_date: None,
            last_modified_time_date: now,
            completed_at: None,
            time_spent: 0,
            remaining_time: None,
            realtime_speed: 0,
            average_speed: 0,
            max_speed: 0,
            total_connection_retries: 0,
            is_file_url_expired: false,
            is_failed_to_access_file: false,
            is_insufficient_storage: false,
            is_waiting_for_network: false,
            settings,
            expected_checksum: None,
            checksum: None,
            video_info: None,
            video_format: None,
            temp_ytdlp_status_info: None,
            is_ytdlp_having_problem: false,
            ytdlp_problem_msg: None,
            is_ytdlp_login_required: false,
            session_started: None,
        }
    }

    /// 创建流媒体任务记录
    pub fn new_stream(
        video_info: VideoInfo,
        video_format: Option<VideoFormat>,
        file_name: impl Into<String>,
        file_directory: impl Into<PathBuf>,
        settings: DownloadSettings,
    ) -> Self {
        let mut record = Self::new(
            video_info.source_url.clone(),
            file_name,
            file_directory,
            settings,
        );
        record.kind = DownloadKind::Stream;
        record.video_info = Some(video_info);
        record.video_format = video_format;
        record
    }

    /// 目标文件完整路径
    pub fn destination_path(&self) -> PathBuf {
        self.file_directory.join(&self.file_name)
    }

    pub fn part_count(&self) -> usize {
        self.part_ranges.len()
    }

    /// 按探测结果设置文件大小并重新规划分片
    pub fn plan_parts(&mut self, file_size: Option<u64>, part_count: usize) {
        match file_size {
            Some(size) if size > 0 => {
                self.file_size = size;
                self.is_unknown_file_size = false;
                self.part_ranges = plan_part_ranges(size, part_count);
            }
            _ => {
                self.file_size = 0;
                self.is_unknown_file_size = true;
                self.part_ranges = vec![PartRange { start: 0, end: None }];
            }
        }
        self.reset_progress();
    }

    /// 清空所有分片进度（重新从头下载）
    pub fn reset_progress(&mut self) {
        let count = self.part_ranges.len();
        self.parts_downloaded_byte = vec![0; count];
        self.part_progress_percentage = vec![0; count];
        self.downloaded_byte = 0;
        self.progress_percentage = 0;
        self.checksum = None;
        if self.is_unknown_file_size {
            self.part_ranges = vec![PartRange { start: 0, end: None }];
            self.parts_downloaded_byte = vec![0];
            self.part_progress_percentage = vec![0];
        }
    }

    /// 记录分片新写入的字节
    pub fn add_part_bytes(&mut self, index: usize, bytes: u64) {
        let Some(done) = self.parts_downloaded_byte.get_mut(index) else {
            return;
        };
        *done += bytes;
        self.downloaded_byte += bytes;

        if let Some(len) = self.part_ranges[index].len() {
            self.part_progress_percentage[index] = percent(*done, len);
        }
        self.refresh_progress();
    }

    /// 回退单个分片（不支持续传时重新从头下载该分片）
    pub fn reset_part(&mut self, index: usize) {
        if let Some(done) = self.parts_downloaded_byte.get_mut(index) {
            self.downloaded_byte -= *done;
            *done = 0;
            self.part_progress_percentage[index] = 0;
            self.refresh_progress();
        }
    }

    fn refresh_progress(&mut self) {
        if !self.is_unknown_file_size && self.file_size > 0 {
            self.progress_percentage = percent(self.downloaded_byte, self.file_size);
        }
    }

    /// 分片下次请求的起始偏移
    pub fn part_resume_offset(&self, index: usize) -> u64 {
        self.part_ranges[index].start + self.parts_downloaded_byte[index]
    }

    /// 分片是否已下载完毕（大小未知的分片只能由完成事件确定）
    pub fn is_part_done(&self, index: usize) -> bool {
        match self.part_ranges[index].len() {
            Some(len) => self.parts_downloaded_byte[index] >= len,
            None => false,
        }
    }

    pub fn all_parts_done(&self) -> bool {
        (0..self.part_ranges.len()).all(|i| self.is_part_done(i))
    }

    /// 大小未知的单分片下载结束后，以实际字节数确定文件大小
    pub fn settle_unknown_size(&mut self) {
        if self.is_unknown_file_size {
            self.file_size = self.downloaded_byte;
            self.is_unknown_file_size = false;
            if self.file_size > 0 {
                self.part_ranges = vec![PartRange {
                    start: 0,
                    end: Some(self.file_size - 1),
                }];
                self.part_progress_percentage = vec![100];
            }
            self.refresh_progress();
        }
    }

    /// 状态迁移，返回旧状态
    pub fn transition(&mut self, next: DownloadStatus) -> Result<DownloadStatus, InvalidTransition> {
        let previous = self.status;
        if !previous.can_transition_to(next) {
            return Err(InvalidTransition {
                from: previous,
                to: next,
            });
        }

        let now = now_millis();
        if previous == DownloadStatus::Downloading {
            self.checkpoint_time_spent();
            self.session_started = None;
            self.realtime_speed = 0;
            self.remaining_time = None;
            self.is_waiting_for_network = false;
        }

        match next {
            DownloadStatus::Downloading => {
                self.session_started = Some(Instant::now());
                // 平均与最高速度只统计当前会话
                self.average_speed = 0;
                self.max_speed = 0;
                if self.start_time_date.is_none() {
                    self.start_time_date = Some(now);
                }
                self.clear_failure();
                self.status_info.clear();
            }
            DownloadStatus::Complete => {
                self.completed_at = Some(now);
                self.progress_percentage = 100;
                self.remaining_time = Some(0);
            }
            _ => {}
        }

        self.status = next;
        self.last_modified_time_date = now;
        Ok(previous)
    }

    /// 把当前会话的耗时累加进 time_spent
    pub fn checkpoint_time_spent(&mut self) {
        if let Some(started) = self.session_started {
            self.time_spent += started.elapsed().as_millis() as u64;
            self.session_started = Some(Instant::now());
        }
    }

    /// 标记失败
    pub fn mark_failed(&mut self, reason: FailureReason) -> Result<DownloadStatus, InvalidTransition> {
        let previous = self.transition(DownloadStatus::Failed)?;

        match &reason {
            FailureReason::UrlExpired { .. } => self.is_file_url_expired = true,
            FailureReason::FileAccess { .. } => self.is_failed_to_access_file = true,
            FailureReason::InsufficientStorage { .. } => self.is_insufficient_storage = true,
            FailureReason::Extractor {
                message,
                login_required,
            } => {
                self.is_ytdlp_having_problem = true;
                self.ytdlp_problem_msg = Some(message.clone());
                self.is_ytdlp_login_required = *login_required;
            }
            _ => {}
        }

        self.status_info = reason.describe();
        self.failure = Some(reason);
        Ok(previous)
    }

    fn clear_failure(&mut self) {
        self.failure = None;
        self.is_file_url_expired = false;
        self.is_failed_to_access_file = false;
        self.is_insufficient_storage = false;
        self.is_ytdlp_having_problem = false;
        self.ytdlp_problem_msg = None;
        self.is_ytdlp_login_required = false;
    }

    /// 读入持久化记录后的状态修正：被进程退出打断的任务视为已暂停
    pub fn normalize_after_load(&mut self) {
        if matches!(
            self.status,
            DownloadStatus::Downloading | DownloadStatus::Queued
        ) {
            self.status = DownloadStatus::Paused;
        }
        self.session_started = None;
        self.realtime_speed = 0;
        self.remaining_time = None;
        self.is_waiting_for_network = false;

        if self.part_ranges.is_empty() {
            self.part_ranges = vec![PartRange { start: 0, end: None }];
        }
        let count = self.part_ranges.len();
        if self.parts_downloaded_byte.len() != count {
            self.parts_downloaded_byte = vec![0; count];
        }

        // 分片计数不超过分片长度，百分比按计数重新计算
        let mut percentages = Vec::with_capacity(count);
        for (range, done) in self.part_ranges.iter().zip(self.parts_downloaded_byte.iter_mut()) {
            match range.len() {
                Some(len) => {
                    *done = (*done).min(len);
                    percentages.push(percent(*done, len));
                }
                None => percentages.push(0),
            }
        }
        self.part_progress_percentage = percentages;
        self.downloaded_byte = self.parts_downloaded_byte.iter().sum();
        if self.status == DownloadStatus::Complete {
            self.progress_percentage = 100;
        } else {
            self.progress_percentage = 0;
            self.refresh_progress();
        }
    }

    /// 分片字节之和与已下载字节一致
    pub fn is_consistent(&self) -> bool {
        self.parts_downloaded_byte.len() == self.part_ranges.len()
            && self.part_progress_percentage.len() == self.part_ranges.len()
            && self.parts_downloaded_byte.iter().sum::<u64>() == self.downloaded_byte
            && self.progress_percentage <= 100
    }

    /// 实时速度（格式化）
    pub fn realtime_speed_in_format(&self) -> String {
        format!("{}/s", format_size(self.realtime_speed))
    }

}

/// 四舍五入的百分比
fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let done = done.min(total) as u128;
    let total = total as u128;
    ((done * 200 + total) / (2 * total)) as u8
}

/// 格式化文件大小
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// 格式化时长（秒）
pub fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}
