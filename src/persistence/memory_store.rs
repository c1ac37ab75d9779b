// 内存记录存储（测试与嵌入场景）

use super::RecordStore;
use crate::downloader::record::DownloadRecord;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: DashMap<String, DownloadRecord>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置记录
    pub fn with_records(records: impl IntoIterator<Item = DownloadRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.records.insert(record.id.clone(), record);
        }
        store
    }

    pub fn get(&self, id: &str) -> Option<DownloadRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn save_record(&self, record: &DownloadRecord) -> Result<()> {
        self.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load_all_records(&self) -> Result<Vec<DownloadRecord>> {
        let mut records: Vec<DownloadRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn delete_record_file(&self, id: &str) -> Result<()> {
        self.records.remove(id);
        Ok(())
    }
}
