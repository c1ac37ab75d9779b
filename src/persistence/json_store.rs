//! JSON 文件存储
//!
//! 每条下载记录保存为 `{records_dir}/{id}.json`，先写临时文件再原子重命名，
//! 写入中断不会留下损坏的记录文件。

use super::RecordStore;
use crate::downloader::record::DownloadRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 记录文件扩展名
const RECORD_EXTENSION: &str = "json";

/// 记录文件路径：`{dir}/{id}.json`
pub fn get_record_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.{}", id, RECORD_EXTENSION))
}

fn ensure_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        debug!("已创建目录: {:?}", dir);
    }
    Ok(())
}

/// 保存记录
pub fn save_record_file(dir: &Path, record: &DownloadRecord) -> io::Result<()> {
    ensure_dir(dir)?;

    let path = get_record_path(dir, &record.id);
    let temp_path = path.with_extension("json.tmp");

    let file = File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, record).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidData, format!("序列化记录失败: {}", e))
    })?;
    writer.flush()?;
    drop(writer);

    fs::rename(&temp_path, &path)?;
    debug!("已保存记录: {:?}", path);
    Ok(())
}

/// 从文件加载单条记录
pub fn load_record_file(path: &Path) -> io::Result<DownloadRecord> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidData, format!("解析记录失败: {}", e))
    })
}

/// 扫描目录下所有记录，无法解析的文件跳过
pub fn scan_all_records(dir: &Path) -> io::Result<Vec<DownloadRecord>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    let mut skipped = 0;

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().map_or(true, |ext| ext != RECORD_EXTENSION) {
            continue;
        }
        match load_record_file(&path) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!("跳过无效记录文件 {:?}: {}", path, e);
                skipped += 1;
            }
        }
    }

    if skipped > 0 {
        warn!("扫描记录完成，跳过 {} 个无效文件", skipped);
    }
    records.sort_by_key(|r| r.created_at);
    Ok(records)
}

/// 删除记录文件（含残留的临时文件），返回是否删除了记录
pub fn remove_record_file(dir: &Path, id: &str) -> io::Result<bool> {
    let path = get_record_path(dir, id);
    let temp_path = path.with_extension("json.tmp");
    if temp_path.exists() {
        let _ = fs::remove_file(&temp_path);
    }
    match fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// 基于 JSON 文件的记录存储
#[derive(Debug, Clone)]
pub struct JsonRecordStore {
    dir: PathBuf,
}

impl JsonRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn save_record(&self, record: &DownloadRecord) -> Result<()> {
        let dir = self.dir.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || save_record_file(&dir, &record))
            .await
            .context("保存记录任务异常退出")?
            .context("保存记录失败")
    }

    async fn load_all_records(&self) -> Result<Vec<DownloadRecord>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || scan_all_records(&dir))
            .await
            .context("扫描记录任务异常退出")?
            .with_context(|| format!("扫描记录目录失败: {:?}", self.dir))
    }

    async fn delete_record_file(&self, id: &str) -> Result<()> {
        let dir = self.dir.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || remove_record_file(&dir, &id))
            .await
            .context("删除记录任务异常退出")?
            .context("删除记录文件失败")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloadSettings;
    use crate::downloader::record::DownloadStatus;
    use tempfile::TempDir;

    fn sample_record() -> DownloadRecord {
        let mut record = DownloadRecord::new(
            "https://example.com/file.bin",
            "file.bin",
            "/downloads",
            DownloadSettings::default(),
        );
        record.plan_parts(Some(4096), 2);
        record.add_part_bytes(1, 100);
        record
    }

    #[test]
    fn test_get_record_path() {
        let path = get_record_path(Path::new("/tmp/records"), "abc");
        assert_eq!(path, PathBuf::from("/tmp/records/abc.json"));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let records_dir = temp_dir.path().join("records");
        let store = JsonRecordStore::new(&records_dir);
        let record = sample_record();

        store.save_record(&record).await.unwrap();
        let loaded = store.load_all_records().await.unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, record.id);
        assert_eq!(loaded[0].parts_downloaded_byte, vec![0, 100]);
        assert_eq!(loaded[0].status, DownloadStatus::Queued);
        assert!(!get_record_path(&records_dir, &record.id)
            .with_extension("json.tmp")
            .exists());
    }

    #[tokio::test]
    async fn test_overwrite_keeps_single_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonRecordStore::new(temp_dir.path());
        let mut record = sample_record();

        store.save_record(&record).await.unwrap();
        record.add_part_bytes(0, 50);
        store.save_record(&record).await.unwrap();

        let loaded = store.load_all_records().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].downloaded_byte, 150);
    }

    #[tokio::test]
    async fn test_corrupted_file_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonRecordStore::new(temp_dir.path());
        store.save_record(&sample_record()).await.unwrap();
        fs::write(temp_dir.path().join("broken.json"), "{ not json").unwrap();
        fs::write(temp_dir.path().join("notes.txt"), "ignored").unwrap();

        let loaded = store.load_all_records().await.unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_record() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonRecordStore::new(temp_dir.path());
        let record = sample_record();
        store.save_record(&record).await.unwrap();

        store.delete_record_file(&record.id).await.unwrap();
        assert!(store.load_all_records().await.unwrap().is_empty());
        // 重复删除不报错
        store.delete_record_file(&record.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_dir_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonRecordStore::new(temp_dir.path().join("none"));
        assert!(store.load_all_records().await.unwrap().is_empty());
    }
}
