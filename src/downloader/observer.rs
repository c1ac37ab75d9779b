//! 下载事件观察者
//!
//! 引擎把记录变化投递到一个无界通道，由单独的分发任务按顺序回调观察者，
//! 因此同一条记录的通知顺序与状态迁移顺序一致。

use super::record::DownloadRecord;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// 观察者
pub trait DownloadObserver: Send + Sync {
    /// 记录发生变化（进度、状态、标记）
    fn on_record_changed(&self, record: &DownloadRecord);

    /// 记录完成并移入已完成列表
    fn on_record_moved_to_finished(&self, _record: &DownloadRecord) {}

    /// 记录被删除或清除
    fn on_record_removed(&self, _id: &str) {}
}

pub type ObserverId = u64;

/// 引擎事件（同时用于 WebSocket 推送）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EngineEvent {
    RecordChanged { record: Box<DownloadRecord> },
    MovedToFinished { record: Box<DownloadRecord> },
    Removed { id: String },
}

impl EngineEvent {
    pub fn record_id(&self) -> &str {
        match self {
            EngineEvent::RecordChanged { record } | EngineEvent::MovedToFinished { record } => {
                &record.id
            }
            EngineEvent::Removed { id } => id,
        }
    }
}

type ObserverList = Vec<(ObserverId, Arc<dyn DownloadObserver>)>;

/// 通知中心
pub(crate) struct NotificationHub {
    observers: Arc<RwLock<ObserverList>>,
    tx: mpsc::UnboundedSender<EngineEvent>,
    next_id: AtomicU64,
}

impl NotificationHub {
    /// 创建并启动分发任务（需在 tokio 运行时内调用）
    pub(crate) fn new() -> Self {
        let observers: Arc<RwLock<ObserverList>> = Arc::new(RwLock::new(Vec::new()));
        let (tx, mut rx) = mpsc::unbounded_channel::<EngineEvent>();

        let dispatch_list = observers.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // 先拷贝列表，回调期间不持锁
                let targets: Vec<Arc<dyn DownloadObserver>> =
                    dispatch_list.read().iter().map(|(_, o)| o.clone()).collect();
                for observer in targets {
                    match &event {
                        EngineEvent::RecordChanged { record } => observer.on_record_changed(record),
                        EngineEvent::MovedToFinished { record } => {
                            observer.on_record_moved_to_finished(record)
                        }
                        EngineEvent::Removed { id } => observer.on_record_removed(id),
                    }
                }
            }
            debug!("通知分发任务退出");
        });

        Self {
            observers,
            tx,
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn register(&self, observer: Arc<dyn DownloadObserver>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.write().push((id, observer));
        id
    }

    pub(crate) fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub(crate) fn changed(&self, record: &DownloadRecord) {
        let _ = self.tx.send(EngineEvent::RecordChanged {
            record: Box::new(record.clone()),
        });
    }

    pub(crate) fn moved_to_finished(&self, record: &DownloadRecord) {
        let _ = self.tx.send(EngineEvent::MovedToFinished {
            record: Box::new(record.clone()),
        });
    }

    pub(crate) fn removed(&self, id: &str) {
        let _ = self.tx.send(EngineEvent::Removed { id: id.to_string() });
    }
}

/// 把事件转发到 broadcast 通道（WebSocket 使用）
pub struct BroadcastObserver {
    tx: broadcast::Sender<EngineEvent>,
}

impl BroadcastObserver {
    pub fn new(tx: broadcast::Sender<EngineEvent>) -> Self {
        Self { tx }
    }
}

impl DownloadObserver for BroadcastObserver {
    fn on_record_changed(&self, record: &DownloadRecord) {
        // 没有订阅者时发送失败是正常的
        let _ = self.tx.send(EngineEvent::RecordChanged {
            record: Box::new(record.clone()),
        });
    }

    fn on_record_moved_to_finished(&self, record: &DownloadRecord) {
        let _ = self.tx.send(EngineEvent::MovedToFinished {
            record: Box::new(record.clone()),
        });
    }

    fn on_record_removed(&self, id: &str) {
        let _ = self.tx.send(EngineEvent::Removed { id: id.to_string() });
    }
}
