//! 下载记录持久化
//!
//! 引擎在每次状态迁移以及下载过程中按固定间隔保存记录快照；
//! 进程重启后通过 `load_all_records` 恢复全部记录。
//!
//! ## 文件结构（JsonRecordStore）
//!
//! ```text
//! records/
//! ├── {id}.json
//! └── {id}.json.tmp   # 写入过程中的临时文件
//! ```

pub mod json_store;
pub mod memory_store;

use crate::downloader::record::DownloadRecord;
use anyhow::Result;
use async_trait::async_trait;

pub use json_store::JsonRecordStore;
pub use memory_store::MemoryRecordStore;

/// 记录存储
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// 保存（覆盖）一条记录
    async fn save_record(&self, record: &DownloadRecord) -> Result<()>;

    /// 读取全部记录，按创建时间排序
    async fn load_all_records(&self) -> Result<Vec<DownloadRecord>>;

    /// 删除记录，不存在时不报错
    async fn delete_record_file(&self, id: &str) -> Result<()>;
}
