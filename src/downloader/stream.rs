//! 流媒体任务适配
//!
//! 由外部提取工具（yt-dlp）负责下载，这里只解析它的输出行，
//! 把进度映射到下载记录上，并把工具的失败转成记录的失败标记。

use super::engine::SharedRecord;
use super::extractor::{ExtractOptions, ExtractorError, MediaExtractor};
use super::record::{format_duration, format_size, DownloadRecord, FailureReason, PartRange};
use super::throttle::ProgressThrottler;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const NUM: &str = r"\d+(?:\.\d+)?";
const UNIT: &str = r"(?:[KMGT]i?)?B";

/// 一行进度信息
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressInfo {
    pub percent: f64,
    pub total: Option<u64>,
    /// 总大小是否为估计值（`~`）
    pub approximate: bool,
    /// 字节/秒
    pub speed: Option<u64>,
    /// 秒
    pub eta: Option<u64>,
    /// (当前分段, 总分段)
    pub fragment: Option<(u32, u32)>,
}

/// 输出行分类
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressLine {
    Progress(ProgressInfo),
    Finished { total: Option<u64> },
    Destination(String),
    AlreadyDownloaded(String),
    PostProcessing { stage: String, detail: String },
    Error(String),
    Unrecognized(String),
}

struct LinePatterns {
    finished: Regex,
    progress: Regex,
    destination: Regex,
    already: Regex,
    post_processing: Regex,
    error: Regex,
}

fn patterns() -> &'static LinePatterns {
    static PATTERNS: OnceLock<LinePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let size = format!(r"(?P<approx>~)?\s*(?P<total>{NUM})\s*(?P<total_unit>{UNIT})");
        LinePatterns {
            finished: Regex::new(&format!(
                r"^\[download\]\s+100(?:\.0+)?%\s+of\s+{size}\s+in\s+[\d:]+"
            ))
            .unwrap(),
            progress: Regex::new(&format!(
                r"^\[download\]\s+(?P<pct>{NUM})%\s+of\s+(?:{size}|Unknown(?:\s+size)?)(?:\s+at\s+(?:(?P<speed>{NUM})\s*(?P<speed_unit>{UNIT})/s|Unknown(?:\s+B/s|\s+speed)?))?(?:\s+ETA\s+(?:(?P<eta>[\d:]+)|Unknown))?(?:\s+\(frag\s+(?P<frag>\d+)/(?P<frags>\d+)\))?"
            ))
            .unwrap(),
            destination: Regex::new(r"^\[download\]\s+Destination:\s+(?P<path>.+)$").unwrap(),
            already: Regex::new(r"^\[download\]\s+(?P<path>.+?)\s+has already been downloaded").unwrap(),
            post_processing: Regex::new(
                r"^\[(?P<stage>Merger|ExtractAudio|ffmpeg|FixupM3u8|FixupM4a|FixupStretched|VideoConvertor|VideoRemuxer|EmbedThumbnail|Metadata|MoveFiles)\]\s*(?P<detail>.*)$",
            )
            .unwrap(),
            error: Regex::new(r"^ERROR:\s*(?P<msg>.+)$").unwrap(),
        }
    })
}

/// 解析带单位的大小（二进制单位按 1024，十进制单位按 1000）
pub fn parse_size(value: &str, unit: &str) -> Option<u64> {
    let value: f64 = value.parse().ok()?;
    let multiplier: f64 = match unit {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}

/// 解析 `SS`、`MM:SS`、`HH:MM:SS`
pub fn parse_clock(value: &str) -> Option<u64> {
    value
        .split(':')
        .try_fold(0u64, |acc, part| part.parse::<u64>().ok().map(|v| acc * 60 + v))
}

/// 解析一行输出
pub fn parse_progress_line(line: &str) -> ProgressLine {
    let line = line.trim();
    let p = patterns();

    if let Some(caps) = p.finished.captures(line) {
        let total = parse_size(&caps["total"], &caps["total_unit"]);
        return ProgressLine::Finished { total };
    }

    if let Some(caps) = p.progress.captures(line) {
        let percent = caps["pct"].parse::<f64>().unwrap_or(0.0).clamp(0.0, 100.0);
        let total = match (caps.name("total"), caps.name("total_unit")) {
            (Some(v), Some(u)) => parse_size(v.as_str(), u.as_str()),
            _ => None,
        };
        let speed = match (caps.name("speed"), caps.name("speed_unit")) {
            (Some(v), Some(u)) => parse_size(v.as_str(), u.as_str()),
            _ => None,
        };
        let eta = caps.name("eta").and_then(|m| parse_clock(m.as_str()));
        let fragment = match (caps.name("frag"), caps.name("frags")) {
            (Some(a), Some(b)) => a.as_str().parse().ok().zip(b.as_str().parse().ok()),
            _ => None,
        };
        return ProgressLine::Progress(ProgressInfo {
            percent,
            total,
            approximate: caps.name("approx").is_some(),
            speed,
            eta,
            fragment,
        });
    }

    if let Some(caps) = p.destination.captures(line) {
        return ProgressLine::Destination(caps["path"].to_string());
    }
    if let Some(caps) = p.already.captures(line) {
        return ProgressLine::AlreadyDownloaded(caps["path"].to_string());
    }
    if let Some(caps) = p.post_processing.captures(line) {
        return ProgressLine::PostProcessing {
            stage: caps["stage"].to_string(),
            detail: caps["detail"].to_string(),
        };
    }
    if let Some(caps) = p.error.captures(line) {
        return ProgressLine::Error(caps["msg"].to_string());
    }

    ProgressLine::Unrecognized(line.to_string())
}

/// 错误信息是否提示需要登录
pub fn looks_like_login_required(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["sign in", "log in", "login", "cookies", "members-only", "private video"]
        .iter()
        .any(|hint| lower.contains(hint))
}

fn set_stream_bytes(record: &mut DownloadRecord, downloaded: u64) {
    if record.part_ranges.len() != 1 {
        record.part_ranges = vec![PartRange { start: 0, end: None }];
    }
    record.parts_downloaded_byte = vec![downloaded];
    record.downloaded_byte = downloaded;
    record.part_progress_percentage = vec![record.progress_percentage];
}

/// 把一行输出应用到记录上，返回解析结果
pub fn apply_progress_line(record: &mut DownloadRecord, line: &str) -> ProgressLine {
    let parsed = parse_progress_line(line);
    record.temp_ytdlp_status_info = Some(line.trim().to_string());

    match &parsed {
        ProgressLine::Progress(info) => {
            // 百分比只增不减（多个格式依次下载时会从 0 重新开始）
            let pct = info.percent.round().clamp(0.0, 100.0) as u8;
            record.progress_percentage = record.progress_percentage.max(pct);

            if let Some(total) = info.total.filter(|t| *t > 0) {
                record.file_size = total;
                record.is_unknown_file_size = false;
                let downloaded = (total as f64 * info.percent / 100.0) as u64;
                set_stream_bytes(record, downloaded);
            }

            record.realtime_speed = info.speed.unwrap_or(0);
            record.max_speed = record.max_speed.max(record.realtime_speed);
            record.remaining_time = info.eta;

            let mut status = format!("{:.1}%", info.percent);
            if let Some(total) = info.total {
                let approx = if info.approximate { "~" } else { "" };
                status.push_str(&format!(" / {}{}", approx, format_size(total)));
            }
            status.push_str(&format!(" · {}", record.realtime_speed_in_format()));
            if let Some(eta) = info.eta {
                status.push_str(&format!(" · ETA {}", format_duration(eta)));
            }
            if let Some((frag, frags)) = info.fragment {
                status.push_str(&format!(" · 分段 {}/{}", frag, frags));
            }
            record.status_info = status;
        }
        ProgressLine::Finished { total } => {
            if let Some(total) = total.filter(|t| *t > 0) {
                record.file_size = total;
                record.is_unknown_file_size = false;
            }
            record.progress_percentage = 100;
            set_stream_bytes(record, record.file_size);
            record.remaining_time = Some(0);
        }
        ProgressLine::Destination(path) => {
            record.status_info = format!("写入: {}", path);
        }
        ProgressLine::AlreadyDownloaded(path) => {
            record.progress_percentage = 100;
            record.status_info = format!("文件已存在: {}", path);
        }
        ProgressLine::PostProcessing { stage, detail } => {
            record.realtime_speed = 0;
            record.status_info = format!("[{}] {}", stage, detail);
        }
        ProgressLine::Error(message) => {
            record.ytdlp_problem_msg = Some(message.clone());
            record.status_info = message.clone();
        }
        ProgressLine::Unrecognized(text) => {
            if !text.is_empty() {
                record.status_info = text.clone();
            }
        }
    }

    parsed
}

/// 流媒体任务结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
    Failed(FailureReason),
}

pub struct StreamTaskAdapter {
    extractor: Arc<dyn MediaExtractor>,
    throttler: ProgressThrottler,
}

impl StreamTaskAdapter {
    pub fn new(extractor: Arc<dyn MediaExtractor>, notify_interval: Duration) -> Self {
        Self {
            extractor,
            throttler: ProgressThrottler::new(notify_interval),
        }
    }

    /// 运行提取工具直到结束，`notify` 按节流间隔收到记录快照
    pub async fn run<N>(
        &self,
        record: &SharedRecord,
        options: &ExtractOptions,
        cancel: &CancellationToken,
        notify: N,
    ) -> StreamOutcome
    where
        N: Fn(&DownloadRecord),
    {
        let (id, source, destination) = {
            let r = record.lock();
            let source = r
                .video_info
                .as_ref()
                .map(|v| v.source_url.clone())
                .unwrap_or_else(|| r.file_url.clone());
            (r.id.clone(), source, r.destination_path())
        };

        info!("流媒体任务开始: id={}, source={}", id, source);

        let (tx, mut rx) = mpsc::channel::<String>(256);
        let run = self
            .extractor
            .run(&source, options, &destination, tx, cancel.clone());
        tokio::pin!(run);

        let mut result = None;
        let mut last_error: Option<String> = None;
        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Some(line) => {
                        let snapshot = {
                            let mut r = record.lock();
                            if let ProgressLine::Error(msg) = apply_progress_line(&mut r, &line) {
                                last_error = Some(msg);
                            }
                            self.throttler.should_emit().then(|| r.clone())
                        };
                        if let Some(snapshot) = snapshot {
                            notify(&snapshot);
                        }
                    }
                    None => break,
                },
                res = &mut run, if result.is_none() => result = Some(res),
            }
        }
        let result = match result {
            Some(result) => result,
            None => run.await,
        };

        self.throttler.force_emit();

        if cancel.is_cancelled() {
            debug!("流媒体任务被取消: id={}", id);
            return StreamOutcome::Cancelled;
        }

        match result {
            Ok(()) => match tokio::fs::metadata(&destination).await {
                Ok(meta) if meta.len() > 0 => {
                    let mut r = record.lock();
                    r.file_size = meta.len();
                    r.is_unknown_file_size = false;
                    r.progress_percentage = 100;
                    r.part_ranges = vec![PartRange {
                        start: 0,
                        end: Some(meta.len() - 1),
                    }];
                    r.parts_downloaded_byte = vec![meta.len()];
                    r.part_progress_percentage = vec![100];
                    r.downloaded_byte = meta.len();
                    info!("流媒体任务完成: id={}, size={}", id, meta.len());
                    StreamOutcome::Completed
                }
                _ => {
                    warn!("提取工具结束但输出文件不存在: {:?}", destination);
                    StreamOutcome::Failed(FailureReason::Extractor {
                        message: "输出文件不存在".to_string(),
                        login_required: false,
                    })
                }
            },
            Err(ExtractorError::Cancelled) => StreamOutcome::Cancelled,
            Err(ExtractorError::LoginRequired(message)) => {
                StreamOutcome::Failed(FailureReason::Extractor {
                    message,
                    login_required: true,
                })
            }
            Err(ExtractorError::Failed(message)) => {
                let message = if message.is_empty() {
                    last_error.unwrap_or_else(|| "提取工具执行失败".to_string())
                } else {
                    message
                };
                let login_required = looks_like_login_required(&message);
                StreamOutcome::Failed(FailureReason::Extractor {
                    message,
                    login_required,
                })
            }
            Err(ExtractorError::Unsupported) => StreamOutcome::Failed(FailureReason::Extractor {
                message: ExtractorError::Unsupported.to_string(),
                login_required: false,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloadSettings;
    use crate::downloader::record::VideoInfo;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::Path;
    use tempfile::TempDir;

    const MIB: f64 = 1024.0 * 1024.0;

    #[test]
    fn test_parse_progress_line() {
        let line = "[download]  42.5% of ~ 150.00MiB at  5.20MiB/s ETA 00:15 (frag 3/120)";
        match parse_progress_line(line) {
            ProgressLine::Progress(info) => {
                assert_eq!(info.percent, 42.5);
                assert_eq!(info.total, Some((150.0 * MIB) as u64));
                assert!(info.approximate);
                assert_eq!(info.speed, Some((5.2 * MIB).round() as u64));
                assert_eq!(info.eta, Some(15));
                assert_eq!(info.fragment, Some((3, 120)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_progress_unknown_speed_and_eta() {
        let line = "[download]   0.0% of   10.00MB at  Unknown B/s ETA Unknown";
        match parse_progress_line(line) {
            ProgressLine::Progress(info) => {
                assert_eq!(info.percent, 0.0);
                assert_eq!(info.total, Some(10_000_000));
                assert!(!info.approximate);
                assert_eq!(info.speed, None);
                assert_eq!(info.eta, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_other_shapes() {
        assert_eq!(
            parse_progress_line("[download] 100% of 150.00MiB in 00:00:30 at 5.00MiB/s"),
            ProgressLine::Finished {
                total: Some((150.0 * MIB) as u64)
            }
        );
        assert_eq!(
            parse_progress_line("[download] Destination: /sdcard/Download/clip.mp4"),
            ProgressLine::Destination("/sdcard/Download/clip.mp4".to_string())
        );
        assert_eq!(
            parse_progress_line("[download] /x/clip.mp4 has already been downloaded"),
            ProgressLine::AlreadyDownloaded("/x/clip.mp4".to_string())
        );
        assert_eq!(
            parse_progress_line("[Merger] Merging formats into \"clip.mp4\""),
            ProgressLine::PostProcessing {
                stage: "Merger".to_string(),
                detail: "Merging formats into \"clip.mp4\"".to_string()
            }
        );
        assert_eq!(
            parse_progress_line("ERROR: [youtube] abc: Sign in to confirm your age"),
            ProgressLine::Error("[youtube] abc: Sign in to confirm your age".to_string())
        );
        assert_eq!(
            parse_progress_line("[youtube] abc: Downloading webpage"),
            ProgressLine::Unrecognized("[youtube] abc: Downloading webpage".to_string())
        );
    }

    #[test]
    fn test_units_and_clock() {
        assert_eq!(parse_size("1", "KiB"), Some(1024));
        assert_eq!(parse_size("1.5", "KB"), Some(1500));
        assert_eq!(parse_size("2", "GiB"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("1", "TB"), Some(1_000_000_000_000));
        assert_eq!(parse_size("1", "XB"), None);
        assert_eq!(parse_clock("00:15"), Some(15));
        assert_eq!(parse_clock("1:02:03"), Some(3723));
        assert_eq!(parse_clock("a:b"), None);
    }

    fn stream_record(dir: &Path) -> DownloadRecord {
        DownloadRecord::new_stream(
            VideoInfo {
                source_url: "https://video.example/watch?v=abc".to_string(),
                ..Default::default()
            },
            None,
            "clip.mp4",
            dir,
            DownloadSettings::default(),
        )
    }

    #[test]
    fn test_apply_progress_is_monotonic() {
        let mut record = stream_record(Path::new("/tmp"));

        apply_progress_line(&mut record, "[download]  50.0% of 10.00MiB at 1.00MiB/s ETA 00:05");
        assert_eq!(record.progress_percentage, 50);
        assert_eq!(record.downloaded_byte, 5 * 1024 * 1024);
        assert_eq!(record.remaining_time, Some(5));
        assert!(record.is_consistent());

        // 第二个格式从 0 开始，总进度不回退
        apply_progress_line(&mut record, "[download]  10.0% of 2.00MiB at 1.00MiB/s ETA 00:02");
        assert_eq!(record.progress_percentage, 50);
        assert!(record.is_consistent());

        apply_progress_line(&mut record, "some unknown tool chatter");
        assert_eq!(record.status_info, "some unknown tool chatter");
        assert_eq!(record.progress_percentage, 50);
    }

    struct ScriptedExtractor {
        lines: Vec<&'static str>,
        result: Mutex<Option<Result<(), ExtractorError>>>,
        write_file: bool,
    }

    #[async_trait]
    impl MediaExtractor for ScriptedExtractor {
        async fn resolve_direct_url(&self, _: &str, _: &ExtractOptions) -> Result<String, ExtractorError> {
            Err(ExtractorError::Unsupported)
        }

        async fn run(
            &self,
            _source: &str,
            _options: &ExtractOptions,
            destination: &Path,
            lines: mpsc::Sender<String>,
            _cancel: CancellationToken,
        ) -> Result<(), ExtractorError> {
            for line in &self.lines {
                let _ = lines.send(line.to_string()).await;
            }
            if self.write_file {
                tokio::fs::write(destination, vec![7u8; 2048]).await.unwrap();
            }
            self.result.lock().take().unwrap_or(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_adapter_completes() {
        let dir = TempDir::new().unwrap();
        let record: SharedRecord = Arc::new(Mutex::new(stream_record(dir.path())));
        let extractor = Arc::new(ScriptedExtractor {
            lines: vec![
                "[download] Destination: clip.mp4",
                "[download]  30.0% of 2.00KiB at 1.00KiB/s ETA 00:01",
                "[download] 100% of 2.00KiB in 00:00:02 at 1.00KiB/s",
                "[Merger] Merging formats into \"clip.mp4\"",
            ],
            result: Mutex::new(None),
            write_file: true,
        });
        let adapter = StreamTaskAdapter::new(extractor, Duration::from_millis(0));
        let notified = Mutex::new(0usize);

        let outcome = adapter
            .run(&record, &ExtractOptions::default(), &CancellationToken::new(), |_| {
                *notified.lock() += 1;
            })
            .await;

        assert_eq!(outcome, StreamOutcome::Completed);
        let r = record.lock();
        assert_eq!(r.file_size, 2048);
        assert_eq!(r.downloaded_byte, 2048);
        assert_eq!(r.progress_percentage, 100);
        assert!(r.is_consistent());
        assert!(*notified.lock() >= 1);
    }

    #[tokio::test]
    async fn test_adapter_login_failure() {
        let dir = TempDir::new().unwrap();
        let record: SharedRecord = Arc::new(Mutex::new(stream_record(dir.path())));
        let extractor = Arc::new(ScriptedExtractor {
            lines: vec!["ERROR: [youtube] abc: Sign in to confirm your age"],
            result: Mutex::new(Some(Err(ExtractorError::Failed(String::new())))),
            write_file: false,
        });
        let adapter = StreamTaskAdapter::new(extractor, Duration::from_millis(100));

        let outcome = adapter
            .run(&record, &ExtractOptions::default(), &CancellationToken::new(), |_| {})
            .await;

        assert_eq!(
            outcome,
            StreamOutcome::Failed(FailureReason::Extractor {
                message: "[youtube] abc: Sign in to confirm your age".to_string(),
                login_required: true,
            })
        );
    }
}
