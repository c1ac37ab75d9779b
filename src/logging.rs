//! 日志系统
//!
//! 控制台输出加可选的文件持久化。文件按大小滚动，启动时清理过期文件。

use crate::config::LogConfig;
use chrono::{Local, NaiveDate};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const FILE_PREFIX: &str = "everydl.";
const FILE_SUFFIX: &str = ".log";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 按大小滚动的日志文件
///
/// 文件名为 `everydl.<启动时间>.log`，滚动后依次为 `everydl.<启动时间>_1.log`、`_2` ...
pub struct RotatingFile {
    dir: PathBuf,
    session: String,
    max_size: u64,
    index: u32,
    written: u64,
    file: File,
}

impl RotatingFile {
    pub fn open(dir: impl Into<PathBuf>, max_size: u64) -> io::Result<Self> {
        let dir = dir.into();
        let session = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        let file = Self::open_segment(&dir, &session, 0)?;
        Ok(Self {
            dir,
            session,
            max_size: max_size.max(1),
            index: 0,
            written: 0,
            file,
        })
    }

    fn segment_path(dir: &Path, session: &str, index: u32) -> PathBuf {
        let name = match index {
            0 => format!("{}{}{}", FILE_PREFIX, session, FILE_SUFFIX),
            n => format!("{}{}_{}{}", FILE_PREFIX, session, n, FILE_SUFFIX),
        };
        dir.join(name)
    }

    fn open_segment(dir: &Path, session: &str, index: u32) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::segment_path(dir, session, index))
    }

    /// 当前写入的文件路径
    pub fn current_path(&self) -> PathBuf {
        Self::segment_path(&self.dir, &self.session, self.index)
    }

    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.index += 1;
        self.file = Self::open_segment(&self.dir, &self.session, self.index)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件直接写入，单条超长日志不会产生空文件
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.roll()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// 日志守卫，需在整个进程生命周期内持有，否则文件写入线程会退出
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化全局日志订阅器
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(true);

    let (file_layer, file_guard) = if config.enabled {
        match open_log_file(config) {
            Ok(file) => {
                let (writer, guard) = tracing_appender::non_blocking(file);
                let layer = fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                    .with_ansi(false)
                    .with_writer(writer);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                // 订阅器尚未就绪，只能写 stderr
                eprintln!(
                    "打开日志文件失败: {:?}, 错误: {}，仅输出到控制台",
                    config.log_dir, e
                );
                (None, None)
            }
        }
    } else {
        (None, None)
    };
    let file_enabled = file_layer.is_some();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if file_enabled {
        info!(
            "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
            config.log_dir,
            config.retention_days,
            config.level,
            config.max_file_size as f64 / 1024.0 / 1024.0
        );
        let removed = purge_expired_logs(
            &config.log_dir,
            config.retention_days,
            Local::now().date_naive(),
        );
        if removed > 0 {
            info!("已清理 {} 个过期日志文件", removed);
        }
    } else {
        info!("日志系统初始化完成（仅控制台输出）");
    }

    LogGuard {
        _file_guard: file_guard,
    }
}

fn open_log_file(config: &LogConfig) -> io::Result<RotatingFile> {
    fs::create_dir_all(&config.log_dir)?;
    RotatingFile::open(&config.log_dir, config.max_file_size)
}

/// 日志文件名中的日期
fn log_file_date(file_name: &str) -> Option<NaiveDate> {
    let stem = file_name
        .strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?;
    NaiveDate::parse_from_str(stem.get(..10)?, "%Y-%m-%d").ok()
}

/// 删除超过保留天数的日志文件，返回删除数量
///
/// 文件名里没有可解析的日期时按修改时间判断。
fn purge_expired_logs(dir: &Path, retention_days: u32, today: NaiveDate) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取日志目录失败: {:?}, 错误: {}", dir, e);
            return 0;
        }
    };
    let retention = chrono::Duration::days(retention_days as i64);

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !path.is_file() || !name.starts_with(FILE_PREFIX) || !name.ends_with(FILE_SUFFIX) {
            continue;
        }

        let file_day = log_file_date(name).or_else(|| {
            let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
            let modified: chrono::DateTime<Local> = modified.into();
            Some(modified.date_naive())
        });
        let expired = file_day.is_some_and(|day| today.signed_duration_since(day) > retention);
        if !expired {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                debug!("已删除过期日志文件: {:?}", path);
            }
            Err(e) => warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_log_file_date() {
        assert_eq!(
            log_file_date("everydl.2026-03-01-101500.log"),
            Some(day("2026-03-01"))
        );
        assert_eq!(
            log_file_date("everydl.2026-03-01-101500_2.log"),
            Some(day("2026-03-01"))
        );
        assert_eq!(log_file_date("everydl.garbage.log"), None);
        assert_eq!(log_file_date("other.2026-03-01-101500.log"), None);
    }

    #[test]
    fn test_rotates_when_full() {
        let dir = TempDir::new().unwrap();
        let mut file = RotatingFile::open(dir.path(), 16).unwrap();
        let first = file.current_path();
        file.write_all(b"0123456789").unwrap();
        file.write_all(b"0123456789").unwrap();
        file.flush().unwrap();

        let second = file.current_path();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("_1.log"));
        assert_eq!(fs::read(&first).unwrap(), b"0123456789");
        assert_eq!(fs::read(&second).unwrap(), b"0123456789");
    }

    #[test]
    fn test_oversized_line_stays_in_empty_file() {
        let dir = TempDir::new().unwrap();
        let mut file = RotatingFile::open(dir.path(), 4).unwrap();
        file.write_all(b"a line longer than the limit").unwrap();
        file.flush().unwrap();

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_purge_expired_logs() {
        let dir = TempDir::new().unwrap();
        let expired = dir.path().join("everydl.2026-01-01-080000.log");
        let expired_rolled = dir.path().join("everydl.2026-01-01-080000_3.log");
        let kept = dir.path().join("everydl.2026-01-05-080000.log");
        let unrelated = dir.path().join("notes.txt");
        for path in [&expired, &expired_rolled, &kept, &unrelated] {
            fs::write(path, b"x").unwrap();
        }

        let removed = purge_expired_logs(dir.path(), 7, day("2026-01-10"));

        assert_eq!(removed, 2);
        assert!(!expired.exists());
        assert!(!expired_rolled.exists());
        assert!(kept.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn test_purge_uses_mtime_without_date() {
        let dir = TempDir::new().unwrap();
        let fresh = dir.path().join("everydl.custom.log");
        fs::write(&fresh, b"x").unwrap();

        assert_eq!(purge_expired_logs(dir.path(), 0, Local::now().date_naive()), 0);
        assert!(fresh.exists());
    }
}
